//! Shared market-data cache fed by the websocket consumers.
//!
//! Reads never touch the network: the perp top-of-book lives in an
//! `ArcSwap` snapshot, the spot depth behind a short-critical-section
//! `RwLock`. Staleness is judged on monotonic time; a stale read returns
//! `None` and the gateway falls back to REST.

pub mod binance_ws;
pub mod user_stream;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::BookLevel;

/// Perp best bid/ask snapshot. Copied out whole on read.
#[derive(Debug, Clone, Copy)]
struct PerpTop {
    bid: f64,
    ask: f64,
    updated: Option<Instant>,
}

#[derive(Debug, Default)]
struct SpotDepth {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    updated: Option<Instant>,
}

pub struct MarketCache {
    spot: RwLock<SpotDepth>,
    perp: ArcSwap<PerpTop>,
    stale_after: Duration,
}

impl MarketCache {
    pub fn new(stale_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            spot: RwLock::new(SpotDepth::default()),
            perp: ArcSwap::from_pointee(PerpTop {
                bid: 0.0,
                ask: 0.0,
                updated: None,
            }),
            stale_after,
        })
    }

    // ── writers (websocket tasks) ───────────────────────────────────────

    pub fn update_spot_depth(&self, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        let mut spot = self.spot.write();
        spot.bids = bids;
        spot.asks = asks;
        spot.updated = Some(Instant::now());
    }

    pub fn update_perp(&self, bid: f64, ask: f64) {
        self.perp.store(Arc::new(PerpTop {
            bid,
            ask,
            updated: Some(Instant::now()),
        }));
    }

    // ── readers ─────────────────────────────────────────────────────────

    fn fresh(&self, updated: Option<Instant>) -> bool {
        matches!(updated, Some(ts) if ts.elapsed() <= self.stale_after)
    }

    /// Current perp best bid, or `None` when unset or stale.
    pub fn perp_bid(&self) -> Option<f64> {
        let top = self.perp.load();
        self.fresh(top.updated).then_some(top.bid)
    }

    pub fn perp_ask(&self) -> Option<f64> {
        let top = self.perp.load();
        self.fresh(top.updated).then_some(top.ask)
    }

    /// Top-`n` spot bids, best first. Empty when unset or stale.
    pub fn spot_bids(&self, n: usize) -> Vec<BookLevel> {
        let spot = self.spot.read();
        if !self.fresh(spot.updated) {
            return Vec::new();
        }
        spot.bids.iter().take(n).copied().collect()
    }

    pub fn spot_asks(&self, n: usize) -> Vec<BookLevel> {
        let spot = self.spot.read();
        if !self.fresh(spot.updated) {
            return Vec::new();
        }
        spot.asks.iter().take(n).copied().collect()
    }

    /// True until both feeds have delivered a fresh update.
    pub fn is_stale(&self) -> bool {
        let perp_fresh = self.fresh(self.perp.load().updated);
        let spot_fresh = self.fresh(self.spot.read().updated);
        !(perp_fresh && spot_fresh)
    }
}
