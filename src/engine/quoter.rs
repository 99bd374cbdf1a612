//! Ladder selection and convergence.
//!
//! Each tick the desired three-level quote set is recomputed from the books
//! and the remaining budget, then the live order set converges toward it
//! with minimum churn: only repriced levels are cancelled here, missing
//! levels are added, and surplus levels are deliberately left alone so a
//! transient spread dip does not thrash the ladder (the coordinator's
//! guards own aggressive cancellation).

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::fills::FillReconciler;
use super::hedger::Hedger;
use super::state::{floor_to_lot, EngineState, LevelOrder, EPS, LEVEL_WEIGHTS};
use crate::config::StrategyConfig;
use crate::journal::TradeJournal;
use crate::models::BookLevel;
use crate::venues::VenueGateway;

/// One desired passive quote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesiredQuote {
    pub level: u8,
    pub price: f64,
    pub qty: f64,
}

pub struct QuoteSynchronizer {
    venue: Arc<dyn VenueGateway>,
    state: Arc<EngineState>,
    hedger: Arc<Hedger>,
    journal: Option<Arc<TradeJournal>>,
    cfg: StrategyConfig,
}

impl QuoteSynchronizer {
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        state: Arc<EngineState>,
        hedger: Arc<Hedger>,
        journal: Option<Arc<TradeJournal>>,
        cfg: StrategyConfig,
    ) -> Self {
        Self {
            venue,
            state,
            hedger,
            journal,
            cfg,
        }
    }

    // ── level selection ─────────────────────────────────────────────────

    /// Computes the desired ladder, all-or-nothing: a single failing level
    /// empties the result, because a partial ladder would leave the lower
    /// weights disproportionately heavy and distort the average entry.
    pub fn select(&self, perp_bid: f64, spot_bids: &[BookLevel]) -> Vec<DesiredQuote> {
        let min_spread = self.state.min_spread();
        let (budget, filled) = {
            let inner = self.state.lock();
            (inner.total_budget_base, inner.ledger.total_filled_base)
        };
        let remaining = (budget - filled).max(0.0);
        let cycle = (budget * self.cfg.cycle_budget_fraction).min(remaining);

        let mut desired = Vec::with_capacity(LEVEL_WEIGHTS.len());
        for &(level, weight) in LEVEL_WEIGHTS.iter() {
            let idx = level as usize - 1;
            let Some(bid) = spot_bids.get(idx) else {
                debug!(level, "book too shallow for ladder");
                return Vec::new();
            };
            if bid.price <= 0.0 {
                return Vec::new();
            }

            let spread = (perp_bid - bid.price) / bid.price;
            if spread < min_spread {
                debug!(
                    level,
                    spread_bps = spread * 10_000.0,
                    min_bps = min_spread * 10_000.0,
                    "spread below floor, no ladder"
                );
                return Vec::new();
            }

            let mut qty = cycle * weight;
            qty = qty.min(self.cfg.depth_consumption_ratio * bid.size);
            qty = floor_to_lot(qty, self.cfg.lot_size);

            if qty * bid.price < self.cfg.min_notional_quote {
                // Raise to the smallest lot multiple clearing the notional
                // floor.
                let lots = (self.cfg.min_notional_quote / bid.price / self.cfg.lot_size).ceil();
                qty = lots * self.cfg.lot_size;
            }

            if qty < self.cfg.min_order_qty {
                debug!(level, qty, "level quantity below minimum, no ladder");
                return Vec::new();
            }

            desired.push(DesiredQuote {
                level,
                price: bid.price,
                qty,
            });
        }
        desired
    }

    // ── reprice test ────────────────────────────────────────────────────

    fn needs_reprice(&self, old_price: f64, old_qty: f64, new_price: f64, new_qty: f64) -> bool {
        let threshold = (self.cfg.reprice_threshold_bps * old_price / 10_000.0)
            .max(self.cfg.reprice_tick_floor * self.cfg.tick_size_spot);
        let price_changed = (new_price - old_price).abs() >= threshold;
        let qty_changed = (new_qty - old_qty).abs() >= self.cfg.lot_size / 2.0;
        price_changed || qty_changed
    }

    // ── cancellation with fill capture ──────────────────────────────────

    /// Cancels one order, capturing fills both before and after the cancel
    /// to cover the fill-during-cancel race. Removes the order from the
    /// ladder and returns its unhedged quantity.
    async fn cancel_and_capture(&self, recon: &mut FillReconciler, order_id: &str) -> f64 {
        let before = recon.detect_unhedged_on_cancel(order_id).await;
        if let Err(e) = self.venue.cancel_order(&self.cfg.symbol_spot, order_id).await {
            warn!(order_id, error = %e, "cancel failed, proceeding with capture");
        }
        let after = recon.detect_unhedged_on_cancel(order_id).await;
        self.state.remove_order(order_id);
        // Both captures report cumulative-minus-hedged, so the later one
        // subsumes the earlier unless the post-cancel query hit the
        // sentinel.
        before.max(after)
    }

    /// Tears down the whole ladder, hedging every fill captured on the way
    /// out. Returns whether hedging succeeded.
    pub async fn cancel_all(&self, recon: &mut FillReconciler) -> bool {
        let ladder = self.state.ladder();
        if ladder.is_empty() {
            return true;
        }
        info!(orders = ladder.len(), "cancelling full ladder");
        let mut unhedged = 0.0;
        for (_, order_id) in ladder {
            unhedged += self.cancel_and_capture(recon, &order_id).await;
        }
        if unhedged > EPS {
            let (ok, _) = self.hedger.try_hedge(unhedged).await;
            return ok;
        }
        true
    }

    // ── convergence ─────────────────────────────────────────────────────

    /// Converges the live ladder toward `desired`. Returns `false` when the
    /// engine must back off (hedge trouble), in which case the ladder has
    /// been torn down.
    pub async fn sync(&self, recon: &mut FillReconciler, desired: &[DesiredQuote]) -> bool {
        let desired_by_level: BTreeMap<u8, DesiredQuote> =
            desired.iter().map(|q| (q.level, *q)).collect();
        let current = self.state.ladder();

        let mut to_add: BTreeMap<u8, DesiredQuote> = desired_by_level
            .iter()
            .filter(|(lv, _)| !current.iter().any(|(clv, _)| clv == *lv))
            .map(|(lv, q)| (*lv, *q))
            .collect();

        // Check overlapping levels for reprice; surplus levels stay put.
        let mut unhedged = 0.0;
        for (level, order_id) in &current {
            let Some(quote) = desired_by_level.get(level) else {
                continue;
            };
            let existing = {
                let inner = self.state.lock();
                inner
                    .active_orders
                    .get(order_id)
                    .map(|o| (o.price, o.qty))
            };
            let Some((old_price, old_qty)) = existing else {
                continue;
            };
            if self.needs_reprice(old_price, old_qty, quote.price, quote.qty) {
                info!(
                    level,
                    old_price,
                    new_price = quote.price,
                    old_qty,
                    new_qty = quote.qty,
                    "repricing level"
                );
                unhedged += self.cancel_and_capture(recon, order_id).await;
                to_add.insert(*level, *quote);
            }
        }

        if unhedged > EPS {
            let (ok, _) = self.hedger.try_hedge(unhedged).await;
            if !ok && !self.hedger.is_accumulating() {
                warn!("hedge failed during reprice, tearing ladder down");
                self.cancel_all(recon).await;
                return false;
            }
        }

        // Failed hedges leave naked exposure the recovery path must clear
        // before we commit new capital. Benign accumulation (sub-notional
        // carry) does not block quoting — it needs fills to grow.
        if self.state.naked_exposure() >= self.cfg.lot_size && !self.hedger.is_accumulating() {
            warn!(
                naked = self.state.naked_exposure(),
                "naked exposure outstanding, tearing ladder down"
            );
            self.cancel_all(recon).await;
            return false;
        }

        // Place missing levels, shallowest first.
        for (level, quote) in to_add {
            match self
                .venue
                .place_spot_limit_buy(&self.cfg.symbol_spot, quote.price, quote.qty)
                .await
            {
                Ok(order_id) => {
                    info!(level, order_id, price = quote.price, qty = quote.qty, "quote placed");
                    if let Some(journal) = &self.journal {
                        journal.log_spot_order(
                            &self.cfg.symbol_spot,
                            &order_id,
                            quote.price,
                            quote.qty,
                        );
                    }
                    self.state
                        .insert_order(LevelOrder::new(level, order_id, quote.price, quote.qty));
                }
                Err(e) => {
                    warn!(level, error = %e, "quote placement failed, retrying next tick");
                    return false;
                }
            }
        }
        true
    }
}
