//! Fill reconciliation: keeps every live order's accounting truthful against
//! push events, periodic REST pulls, and cancellation races, then drives the
//! hedger with whatever is not yet covered.
//!
//! Push events carry cumulative quantities, so stale or reordered deliveries
//! are harmless — a cumulative value can only ratchet up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::hedger::Hedger;
use super::state::{EngineState, EPS};
use crate::journal::TradeJournal;
use crate::models::{FillEvent, OrderClosed};
use crate::venues::VenueGateway;

const GAP_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct FillReconciler {
    venue: Arc<dyn VenueGateway>,
    state: Arc<EngineState>,
    hedger: Arc<Hedger>,
    journal: Option<Arc<TradeJournal>>,
    fills_rx: mpsc::Receiver<FillEvent>,
    symbol_spot: String,
    lot: f64,
    pull_interval: Duration,
    /// Push events seen but not yet applied, max-merged per order.
    pending: HashMap<String, f64>,
    pub(crate) last_pull: Instant,
    pub(crate) last_gap_check: Instant,
}

impl FillReconciler {
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        state: Arc<EngineState>,
        hedger: Arc<Hedger>,
        journal: Option<Arc<TradeJournal>>,
        fills_rx: mpsc::Receiver<FillEvent>,
        symbol_spot: String,
        lot: f64,
        pull_interval: Duration,
    ) -> Self {
        Self {
            venue,
            state,
            hedger,
            journal,
            fills_rx,
            symbol_spot,
            lot,
            pull_interval,
            pending: HashMap::new(),
            last_pull: Instant::now(),
            last_gap_check: Instant::now(),
        }
    }

    /// Drains the push channel into `pending`, keeping the max cumulative
    /// quantity per order. Events for unknown orders are dropped.
    fn drain_push(&mut self) {
        loop {
            match self.fills_rx.try_recv() {
                Ok(event) => {
                    let known = self.state.lock().active_orders.contains_key(&event.order_id);
                    if !known {
                        debug!(order_id = %event.order_id, "fill event for unknown order ignored");
                        continue;
                    }
                    let entry = self.pending.entry(event.order_id.clone()).or_insert(0.0);
                    if event.cum_filled_base > *entry {
                        *entry = event.cum_filled_base;
                    }
                    info!(
                        order_id = %event.order_id,
                        cum = event.cum_filled_base,
                        last_qty = event.last_fill_qty,
                        last_px = event.last_fill_px,
                        "fill event"
                    );
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
    }

    /// Credits new fills on one order to the ledger. Returns the quantity not
    /// yet hedged. Cumulative values can never regress accounting.
    fn record_fill(&self, order_id: &str, cum_filled: f64) -> f64 {
        let mut inner = self.state.lock();
        let Some(order) = inner.active_orders.get_mut(order_id) else {
            return 0.0;
        };
        let price = order.price;
        let new_accounted = cum_filled - order.accounted_qty;
        if new_accounted > EPS {
            order.accounted_qty = cum_filled;
            let unhedged = cum_filled - order.hedged_qty;
            inner.ledger.total_filled_base += new_accounted;
            inner.ledger.total_filled_quote += new_accounted * price;
            drop(inner);
            if let Some(journal) = &self.journal {
                journal.log_spot_fill(&self.symbol_spot, order_id, price, new_accounted);
            }
            return unhedged.max(0.0);
        }
        (cum_filled - order.hedged_qty).max(0.0)
    }

    /// One reconciliation pass: drain push, maybe pull, account, hedge,
    /// prune fully-done orders. Returns the orders closed this pass.
    pub async fn tick(&mut self) -> Vec<OrderClosed> {
        self.drain_push();

        // Periodic REST pull guards against dropped push events. Cross-venue
        // deployments run this much tighter.
        if self.last_pull.elapsed() >= self.pull_interval {
            let ids: Vec<String> = self
                .state
                .lock()
                .active_orders
                .keys()
                .cloned()
                .collect();
            for id in ids {
                match self.venue.get_order_filled_qty(&self.symbol_spot, &id).await {
                    Ok(filled) if filled >= 0.0 => {
                        let entry = self.pending.entry(id).or_insert(0.0);
                        if filled > *entry {
                            *entry = filled;
                        }
                    }
                    Ok(_) => {
                        // Sentinel: the venue purged the order. Accounting
                        // stays as-is; a cancel path will clean it up.
                        debug!(order_id = %id, "pull returned sentinel, leaving order unchanged");
                    }
                    Err(e) => warn!(order_id = %id, error = %e, "pull reconciliation failed"),
                }
            }
            self.last_pull = Instant::now();
        }

        let order_fills = std::mem::take(&mut self.pending);

        // Account fills and collect what still needs hedging, plus orders
        // that reached their full quantity.
        let mut per_order_unhedged: Vec<(u8, String, f64)> = Vec::new();
        let mut total_unhedged = 0.0;
        let mut full: Vec<String> = Vec::new();

        for (id, cum) in order_fills {
            let unhedged = self.record_fill(&id, cum);
            let inner = self.state.lock();
            let Some(order) = inner.active_orders.get(&id) else {
                continue;
            };
            if unhedged > EPS {
                per_order_unhedged.push((order.level, id.clone(), unhedged));
                total_unhedged += unhedged;
            }
            if cum >= order.qty - EPS {
                full.push(id);
            }
        }

        // Hedge the batch; allocate the covered amount back to orders in
        // ascending level order so the split is deterministic.
        if total_unhedged > EPS {
            let (_ok, hedged) = self.hedger.try_hedge(total_unhedged).await;
            per_order_unhedged.sort_by_key(|&(level, _, _)| level);
            let mut remaining = hedged;
            let mut inner = self.state.lock();
            for (_, id, unhedged) in &per_order_unhedged {
                if let Some(order) = inner.active_orders.get_mut(id) {
                    let from_hedge = unhedged.min(remaining);
                    remaining -= from_hedge;
                    // Whatever the perp sell did not cover now sits in
                    // naked_exposure, which owns it from here on. Advance
                    // hedged_qty for the full amount either way so the next
                    // pass does not resubmit quantity the recovery path is
                    // already carrying.
                    order.hedged_qty += unhedged;
                }
            }
        }

        // Prune orders that are both fully filled and fully hedged.
        let mut closed = Vec::new();
        for id in full {
            let done = {
                let inner = self.state.lock();
                inner
                    .active_orders
                    .get(&id)
                    .map(|o| o.hedged_qty >= o.qty - EPS)
                    .unwrap_or(false)
            };
            if done {
                if let Some(order) = self.state.remove_order(&id) {
                    info!(
                        level = order.level,
                        order_id = %id,
                        price = order.price,
                        qty = order.qty,
                        "order fully filled and hedged"
                    );
                    if order.level == 1 {
                        // Level 1 gone means the top of book moved through
                        // us; rebuild the whole ladder around the new top.
                        self.state.set_requote_all();
                    }
                    closed.push(OrderClosed {
                        order_id: id,
                        level: order.level,
                    });
                }
            }
        }

        self.gap_check();
        closed
    }

    /// Cumulative-drift compensation for dropped events: every 30s compare
    /// the ledger legs and force any excess into naked exposure where the
    /// recovery path will deal with it.
    fn gap_check(&mut self) {
        if self.last_gap_check.elapsed() < GAP_CHECK_INTERVAL {
            return;
        }
        self.last_gap_check = Instant::now();

        let mut inner = self.state.lock();
        let ledger = &mut inner.ledger;
        let gap = ledger.total_filled_base - ledger.total_hedged_base - ledger.naked_exposure;
        if gap >= self.lot {
            warn!(gap, "ledger gap detected, adding to naked exposure");
            ledger.naked_exposure += gap;
        } else if gap <= -self.lot {
            warn!(gap, "ledger gap negative: system over-hedged");
        }
    }

    /// Synchronous fill detection around a cancellation: prefer any push
    /// event already queued for this order, fall back to a REST pull, and
    /// return the unhedged remainder.
    pub async fn detect_unhedged_on_cancel(&mut self, order_id: &str) -> f64 {
        self.drain_push();

        let cum = match self.pending.remove(order_id) {
            Some(cum) => Some(cum),
            None => match self.venue.get_order_filled_qty(&self.symbol_spot, order_id).await {
                Ok(filled) if filled >= 0.0 => Some(filled),
                Ok(_) => {
                    warn!(order_id, "cancel-time query returned sentinel, skipping fill check");
                    None
                }
                Err(e) => {
                    warn!(order_id, error = %e, "cancel-time fill query failed");
                    None
                }
            },
        };

        match cum {
            Some(cum) => self.record_fill(order_id, cum),
            None => 0.0,
        }
    }

}
