//! Asynchronous inventory unwind: sell spot passively on the ask side,
//! buy perp back as the sells fill.
//!
//! Runs as its own task, at most one at a time. Quotes rest on ask 2 and
//! ask 3 only — ask 1 would cross and pay taker slippage. Every incremental
//! sell fill triggers a matching perp market buy, floored to lot; the
//! sub-lot remainder rides in `pending_hedge` until it grows or the task
//! ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::state::{floor_to_lot, EngineState, EPS};
use crate::config::StrategyConfig;
use crate::journal::TradeJournal;
use crate::models::{BookLevel, CloseOrderView, CloseStatus};
use crate::notify::Notifier;
use crate::venues::{VenueError, VenueGateway};

const MAX_CLOSE_ROUNDS: u32 = 200;
const ROUND_MAX_WAIT: Duration = Duration::from_secs(8);
const LADDER_DRAIN_WAIT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_millis(150);

/// Close-side weights: ask level -> share of the remaining quantity.
const CLOSE_WEIGHTS: [(usize, f64); 2] = [(2, 0.3), (3, 0.7)];

/// Shared gate + status for the close task. Owned alongside the engine
/// state; the control surface reads snapshots and flips the flags.
pub struct CloseHandle {
    status: parking_lot::Mutex<CloseStatus>,
    active: AtomicBool,
    paused: AtomicBool,
    finish: AtomicBool,
}

impl CloseHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: parking_lot::Mutex::new(CloseStatus::default()),
            active: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            finish: AtomicBool::new(false),
        })
    }

    pub fn snapshot(&self) -> CloseStatus {
        self.status.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        let mut status = self.status.lock();
        status.paused = paused;
    }

    pub fn request_finish(&self) {
        self.finish.store(true, Ordering::SeqCst);
    }

    fn finish_requested(&self) -> bool {
        self.finish.load(Ordering::SeqCst)
    }

    /// Claims the single-task slot. Fails when a close is already running.
    pub fn try_begin(&self, symbol: &str, target_qty: f64) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.finish.store(false, Ordering::SeqCst);
        *self.status.lock() = CloseStatus {
            running: true,
            symbol: symbol.to_string(),
            target_qty,
            msg: "starting".to_string(),
            ..CloseStatus::default()
        };
        true
    }

    fn end(&self, msg: &str) {
        {
            let mut status = self.status.lock();
            status.running = false;
            status.open_orders.clear();
            status.msg = msg.to_string();
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// One live close-side sell order.
struct CloseOrder {
    id: String,
    price: f64,
    qty: f64,
    filled_seen: f64,
}

pub struct CloseTask {
    venue: Arc<dyn VenueGateway>,
    state: Arc<EngineState>,
    handle: Arc<CloseHandle>,
    journal: Option<Arc<TradeJournal>>,
    notifier: Option<Arc<Notifier>>,
    cfg: StrategyConfig,
    symbol: String,
    target_qty: f64,
    spot_sold: f64,
    spot_sold_quote: f64,
    perp_bought: f64,
    perp_bought_quote: f64,
    pending_hedge: f64,
    orders: Vec<CloseOrder>,
}

impl CloseTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        state: Arc<EngineState>,
        handle: Arc<CloseHandle>,
        journal: Option<Arc<TradeJournal>>,
        notifier: Option<Arc<Notifier>>,
        cfg: StrategyConfig,
        symbol: String,
        target_qty: f64,
    ) -> Self {
        Self {
            venue,
            state,
            handle,
            journal,
            notifier,
            cfg,
            symbol,
            target_qty,
            spot_sold: 0.0,
            spot_sold_quote: 0.0,
            perp_bought: 0.0,
            perp_bought_quote: 0.0,
            pending_hedge: 0.0,
            orders: Vec::new(),
        }
    }

    fn publish_status(&self, msg: &str) {
        let mut status = self.handle.status.lock();
        status.spot_sold = self.spot_sold;
        status.spot_sold_quote = self.spot_sold_quote;
        status.perp_bought = self.perp_bought;
        status.perp_bought_quote = self.perp_bought_quote;
        status.pending_hedge = self.pending_hedge;
        status.open_orders = self
            .orders
            .iter()
            .map(|o| CloseOrderView {
                id: o.id.clone(),
                price: o.price,
                qty: o.qty,
                filled: o.filled_seen,
            })
            .collect();
        status.msg = msg.to_string();
    }

    fn remaining(&self) -> f64 {
        (self.target_qty - self.spot_sold).max(0.0)
    }

    fn should_stop(&self) -> bool {
        !self.state.is_running() || self.handle.finish_requested()
    }

    /// The whole unwind. Consumes the task; the handle outlives it.
    pub async fn run(mut self) {
        info!(symbol = %self.symbol, target = self.target_qty, "close task started");
        if let Some(notifier) = &self.notifier {
            notifier.notify_close_start(&self.symbol, self.target_qty);
        }

        // Precondition: the open ladder must be gone before we sell the
        // inventory out from under it. The paused coordinator cancels it;
        // we wait for that to land.
        let drain_deadline = Instant::now() + LADDER_DRAIN_WAIT;
        while self.state.order_count() > 0 {
            if Instant::now() > drain_deadline || self.should_stop() {
                warn!("open ladder did not drain, aborting close task");
                self.handle.end("aborted: open orders still live");
                return;
            }
            tokio::time::sleep(self.cfg.poll_interval()).await;
        }

        let mut rounds = 0u32;
        while rounds < MAX_CLOSE_ROUNDS {
            if self.should_stop() {
                break;
            }
            if self.handle.is_paused() {
                self.publish_status("paused");
                tokio::time::sleep(self.cfg.poll_interval()).await;
                continue;
            }
            if self.remaining() <= self.cfg.min_order_qty + EPS {
                break;
            }

            rounds += 1;
            self.run_round(rounds).await;
        }

        self.finish_up(rounds).await;
    }

    /// One quoting round: wait for workable spreads, place the two sells,
    /// poll fills, hedge them, tear down at the end.
    async fn run_round(&mut self, round: u32) {
        let round_deadline = Instant::now() + ROUND_MAX_WAIT;

        // Spread gate: both ask-2 and ask-3 must clear the floor before
        // either order goes out.
        let quotes = loop {
            if self.should_stop() || self.handle.is_paused() {
                return;
            }
            if Instant::now() > round_deadline {
                self.publish_status("waiting for close spread");
                return;
            }
            match self.pick_close_quotes().await {
                Some(quotes) => break quotes,
                None => tokio::time::sleep(self.cfg.poll_interval()).await,
            }
        };

        for (price, qty) in quotes {
            match self
                .venue
                .place_spot_limit_sell(&self.symbol, price, qty)
                .await
            {
                Ok(id) => {
                    info!(order_id = %id, price, qty, round, "close sell placed");
                    if let Some(journal) = &self.journal {
                        journal.log_close_order(&self.symbol, &id, price, qty);
                    }
                    self.orders.push(CloseOrder {
                        id,
                        price,
                        qty,
                        filled_seen: 0.0,
                    });
                }
                Err(e) => warn!(price, qty, error = %e, "close sell placement failed"),
            }
        }
        self.publish_status(&format!("round {round}: quoting"));

        // Fill-poll window.
        while Instant::now() <= round_deadline {
            if self.should_stop() || self.handle.is_paused() {
                break;
            }
            tokio::time::sleep(self.cfg.poll_interval()).await;

            self.poll_fills().await;
            self.publish_status(&format!("round {round}: polling"));

            if self.orders.iter().all(|o| o.filled_seen >= o.qty - EPS) {
                break;
            }
            if self.detect_drift().await {
                info!(round, "close quotes drifted above the book, requoting");
                break;
            }
        }

        // End of round: cancel leftovers with one final race-catching pull,
        // then flush the pending hedge.
        self.teardown_orders().await;
        self.flush_pending_hedge().await;
        self.publish_status(&format!("round {round}: done"));
    }

    /// Reads the books and computes the two ask-side quotes, or `None` when
    /// either spread is below the floor.
    async fn pick_close_quotes(&self) -> Option<Vec<(f64, f64)>> {
        let asks = match self.venue.get_spot_asks(&self.symbol, 5).await {
            Ok(asks) if asks.len() >= 3 => asks,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "cannot read spot asks");
                return None;
            }
        };
        let perp_ask = match self.venue.get_futures_best_ask(&self.cfg.symbol_perp).await {
            Ok(ask) if ask > 0.0 => ask,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "cannot read perp ask");
                return None;
            }
        };

        let min_spread = self.state.min_spread();
        for &(level, _) in CLOSE_WEIGHTS.iter() {
            let price = asks[level - 1].price;
            if price <= 0.0 || (price - perp_ask) / price < min_spread {
                return None;
            }
        }

        let remaining = self.remaining();
        let mut quotes = Vec::with_capacity(CLOSE_WEIGHTS.len());
        let mut allocated = 0.0;
        for &(level, weight) in CLOSE_WEIGHTS.iter() {
            let price = asks[level - 1].price;
            let mut qty = floor_to_lot(remaining * weight, self.cfg.lot_size);
            if qty * price < self.cfg.min_notional_quote {
                let lots =
                    (self.cfg.min_notional_quote / price / self.cfg.lot_size).ceil();
                qty = lots * self.cfg.lot_size;
            }
            // Never sell more than the inventory we are unwinding.
            if allocated + qty > remaining + EPS {
                qty = floor_to_lot(remaining - allocated, self.cfg.lot_size);
            }
            if qty < self.cfg.min_order_qty {
                continue;
            }
            allocated += qty;
            quotes.push((price, qty));
        }
        if quotes.is_empty() {
            return None;
        }
        Some(quotes)
    }

    /// Polls each live sell and hedges incremental fills with perp buys.
    async fn poll_fills(&mut self) {
        let mut new_fills: Vec<(usize, f64)> = Vec::new();
        for (i, order) in self.orders.iter().enumerate() {
            match self.venue.get_order_filled_qty(&self.symbol, &order.id).await {
                Ok(filled) if filled >= 0.0 => {
                    let new_fill = filled - order.filled_seen;
                    if new_fill > EPS {
                        new_fills.push((i, filled));
                    }
                }
                Ok(_) => {} // sentinel, keep the last known value
                Err(e) => warn!(order_id = %order.id, error = %e, "close fill poll failed"),
            }
        }

        for (i, filled) in new_fills {
            let (id, price, prev) = {
                let order = &self.orders[i];
                (order.id.clone(), order.price, order.filled_seen)
            };
            let new_fill = filled - prev;
            self.orders[i].filled_seen = filled;
            self.spot_sold += new_fill;
            self.spot_sold_quote += new_fill * price;
            self.pending_hedge += new_fill;
            info!(order_id = %id, new_fill, total_sold = self.spot_sold, "close sell filled");
            if let Some(journal) = &self.journal {
                journal.log_close_fill(&self.symbol, &id, price, new_fill);
            }
            if let Some(notifier) = &self.notifier {
                notifier.notify_close_trade(
                    &self.symbol,
                    new_fill,
                    self.spot_sold,
                    self.perp_bought,
                    self.target_qty,
                );
            }
            self.flush_pending_hedge().await;
        }
    }

    /// Buys back the lot-floored pending quantity on the perp leg.
    async fn flush_pending_hedge(&mut self) {
        let buy_qty = floor_to_lot(self.pending_hedge, self.cfg.lot_size);
        if buy_qty < self.cfg.lot_size {
            return;
        }
        for attempt in 1..=self.cfg.max_retry.max(1) {
            match self
                .venue
                .place_futures_market_buy(&self.cfg.symbol_perp, buy_qty)
                .await
            {
                Ok(order_id) => {
                    let avg_px = self.venue.last_hedge_avg_price();
                    self.pending_hedge = (self.pending_hedge - buy_qty).max(0.0);
                    self.perp_bought += buy_qty;
                    if let Some(px) = avg_px.filter(|&p| p > 0.0) {
                        self.perp_bought_quote += buy_qty * px;
                    }
                    info!(order_id, qty = buy_qty, avg_price = ?avg_px, "perp bought back");
                    if let Some(journal) = &self.journal {
                        journal.log_close_hedge(&self.cfg.symbol_perp, &order_id, buy_qty, avg_px);
                    }
                    return;
                }
                Err(e @ VenueError::NotionalTooSmall) => {
                    warn!(qty = buy_qty, error = %e, "perp buy below notional floor, carrying");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "perp buy failed");
                    if e.is_retryable() && attempt < self.cfg.max_retry.max(1) {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    } else {
                        error!(qty = buy_qty, "perp buy-back failed, quantity stays pending");
                        return;
                    }
                }
            }
        }
    }

    /// Drift: any of our sell prices sits above `ask5 + 0.5 tick`, i.e. the
    /// market fell out from under the quotes.
    async fn detect_drift(&self) -> bool {
        let asks: Vec<BookLevel> = match self.venue.get_spot_asks(&self.symbol, 5).await {
            Ok(asks) if !asks.is_empty() => asks,
            _ => return false,
        };
        let Some(deepest) = asks.last() else {
            return false;
        };
        let ceiling = deepest.price + 0.5 * self.cfg.tick_size_spot;
        self.orders.iter().any(|o| o.price > ceiling)
    }

    /// Cancels whatever is still open, pulling fills one last time to catch
    /// cancellation races.
    async fn teardown_orders(&mut self) {
        let open: Vec<usize> = (0..self.orders.len()).collect();
        for i in open {
            let id = self.orders[i].id.clone();
            if self.orders[i].filled_seen < self.orders[i].qty - EPS {
                if let Err(e) = self.venue.cancel_order(&self.symbol, &id).await {
                    warn!(order_id = %id, error = %e, "close cancel failed");
                }
            }
        }
        self.poll_fills().await;
        self.orders.clear();
    }

    async fn finish_up(&mut self, rounds: u32) {
        self.teardown_orders().await;
        self.flush_pending_hedge().await;

        // Sub-lot tail: hand it to the main loop's recovery ledger so the
        // engine is never wedged on close-task dust.
        if self.pending_hedge > EPS {
            warn!(
                pending = self.pending_hedge,
                "residual close hedge transferred to naked exposure"
            );
            self.state.lock().ledger.naked_exposure += self.pending_hedge;
            self.pending_hedge = 0.0;
        }

        let msg = if self.handle.finish_requested() {
            format!("finished by operator after {rounds} rounds")
        } else if self.remaining() <= self.cfg.min_order_qty + EPS {
            format!("target reached in {rounds} rounds")
        } else {
            format!("rounds exhausted, {:.6} base left", self.remaining())
        };
        info!(
            sold = self.spot_sold,
            bought = self.perp_bought,
            rounds,
            "close task finished"
        );
        self.publish_status(&msg);
        self.handle.end(&msg);
        if let Some(notifier) = &self.notifier {
            notifier.notify_finish_close(&self.handle.snapshot());
        }
    }
}
