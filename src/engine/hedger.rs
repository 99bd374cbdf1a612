//! Hedge execution: turns unhedged spot inventory into perpetual market
//! sells.
//!
//! Quantities below the lot grid, or below the venue's notional floor, are
//! carried in `naked_exposure` until enough accumulates — that is explicit
//! accumulation, not failure. Genuine venue failures escalate to naked
//! exposure too, but flip the engine into protective mode via the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use super::state::{floor_to_lot, EngineState, EPS};
use crate::config::StrategyConfig;
use crate::journal::TradeJournal;
use crate::notify::Notifier;
use crate::venues::{VenueError, VenueGateway};

const RETRY_BACKOFF: Duration = Duration::from_millis(150);

pub struct Hedger {
    venue: Arc<dyn VenueGateway>,
    state: Arc<EngineState>,
    journal: Option<Arc<TradeJournal>>,
    notifier: Option<Arc<Notifier>>,
    symbol_perp: String,
    lot: f64,
    max_retry: u32,
    /// Serializes snapshot -> place -> commit. The engine state lock is
    /// never held across the venue call.
    hedge_lock: AsyncMutex<()>,
    /// True while naked exposure exists because the venue cannot accept it
    /// yet (sub-lot or below notional floor). Distinguishes benign
    /// accumulation from failed hedges so the quoter does not tear the
    /// ladder down while inventory is still growing toward the floor.
    accumulating: AtomicBool,
}

impl Hedger {
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        state: Arc<EngineState>,
        cfg: &StrategyConfig,
        journal: Option<Arc<TradeJournal>>,
        notifier: Option<Arc<Notifier>>,
    ) -> Self {
        Self {
            venue,
            state,
            journal,
            notifier,
            symbol_perp: cfg.symbol_perp.clone(),
            lot: cfg.lot_size,
            max_retry: cfg.max_retry.max(1),
            hedge_lock: AsyncMutex::new(()),
            accumulating: AtomicBool::new(false),
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.accumulating.load(Ordering::SeqCst)
    }

    fn commit_success(&self, hedge_qty: f64, avg_px: Option<f64>, residual: f64) {
        {
            let mut inner = self.state.lock();
            inner.ledger.total_hedged_base += hedge_qty;
            if let Some(px) = avg_px.filter(|&p| p > 0.0) {
                inner.ledger.total_hedged_quote += hedge_qty * px;
                inner.ledger.total_hedged_base_priced += hedge_qty;
            }
            inner.ledger.naked_exposure = residual;
        }
        self.accumulating.store(residual > EPS, Ordering::SeqCst);
    }

    fn persist_naked(&self, total: f64, accumulating: bool) {
        self.state.lock().ledger.naked_exposure = total;
        self.accumulating.store(accumulating, Ordering::SeqCst);
    }

    fn notify_progress(&self, hedge_qty: f64, avg_px: Option<f64>) {
        if let Some(notifier) = &self.notifier {
            let (filled, budget) = {
                let inner = self.state.lock();
                (inner.ledger.total_filled_base, inner.total_budget_base)
            };
            notifier.notify_hedge(&self.symbol_perp, hedge_qty, avg_px, filled, budget);
        }
    }

    /// Attempts the perp market sell with retries on transient failures.
    async fn place_with_retry(&self, qty: f64) -> Result<(String, Option<f64>), VenueError> {
        let mut last_err = VenueError::Transient("no attempt made".into());
        for attempt in 1..=self.max_retry {
            match self.venue.place_futures_market_sell(&self.symbol_perp, qty).await {
                Ok(order_id) => {
                    let avg_px = self.venue.last_hedge_avg_price();
                    return Ok((order_id, avg_px));
                }
                Err(e @ VenueError::NotionalTooSmall) => return Err(e),
                Err(e) => {
                    warn!(attempt, max = self.max_retry, error = %e, "hedge attempt failed");
                    let retryable = e.is_retryable();
                    last_err = e;
                    if !retryable {
                        break;
                    }
                    if attempt < self.max_retry {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Hedge `qty` base (plus any carried naked exposure), floored to lot.
    ///
    /// Returns `(ok, hedged_base)`. `ok = true` with `hedged_base = 0` means
    /// the quantity was carried (sub-lot accumulation); `ok = false` means
    /// the venue refused and the full amount now sits in naked exposure.
    pub async fn try_hedge(&self, qty: f64) -> (bool, f64) {
        if qty <= EPS {
            return (true, 0.0);
        }
        let _guard = self.hedge_lock.lock().await;

        let total = qty + self.state.lock().ledger.naked_exposure;
        let hedge_qty = floor_to_lot(total, self.lot);
        let residual = (total - hedge_qty).max(0.0);

        if hedge_qty < self.lot {
            self.persist_naked(total, true);
            warn!(
                total,
                lot = self.lot,
                "hedge quantity below lot, carrying until it accumulates"
            );
            return (true, 0.0);
        }

        match self.place_with_retry(hedge_qty).await {
            Ok((order_id, avg_px)) => {
                self.commit_success(hedge_qty, avg_px, residual);
                info!(order_id, qty = hedge_qty, avg_price = ?avg_px, "hedge placed");
                if let Some(journal) = &self.journal {
                    journal.log_hedge(&self.symbol_perp, &order_id, hedge_qty, true, avg_px);
                }
                self.notify_progress(hedge_qty, avg_px);
                (true, hedge_qty)
            }
            Err(VenueError::NotionalTooSmall) => {
                self.persist_naked(total, true);
                warn!(
                    total,
                    "hedge below venue notional floor, accumulating without retry"
                );
                (false, 0.0)
            }
            Err(e) => {
                self.persist_naked(total, false);
                error!(qty = hedge_qty, error = %e, "hedge failed after retries, naked exposure");
                if let Some(journal) = &self.journal {
                    journal.log_hedge(&self.symbol_perp, "", hedge_qty, false, None);
                }
                if let Some(notifier) = &self.notifier {
                    notifier.notify_naked_exposure(&self.symbol_perp, total);
                }
                (false, 0.0)
            }
        }
    }

    /// Periodic recovery of naked exposure.
    ///
    /// `remaining_budget` tells the hedger whether more fills can still
    /// arrive: a sub-lot residual that can no longer grow is zeroed with a
    /// warning rather than wedging the engine forever.
    pub async fn try_recover(&self, remaining_budget: f64) -> bool {
        if self.state.lock().ledger.naked_exposure <= EPS {
            return true;
        }
        let _guard = self.hedge_lock.lock().await;

        let naked = self.state.lock().ledger.naked_exposure;
        if naked <= EPS {
            return true;
        }
        warn!(naked, "attempting naked-exposure recovery");

        let hedge_qty = floor_to_lot(naked, self.lot);
        if hedge_qty < self.lot {
            if remaining_budget < self.lot {
                warn!(
                    dust = naked,
                    "sub-lot naked exposure cannot grow further, zeroing as dust"
                );
                self.persist_naked(0.0, false);
            }
            // Otherwise carried: the next fill's hedge absorbs it.
            return true;
        }

        match self.place_with_retry(hedge_qty).await {
            Ok((order_id, avg_px)) => {
                let residual = (naked - hedge_qty).max(0.0);
                self.commit_success(hedge_qty, avg_px, residual);
                info!(order_id, qty = hedge_qty, "naked exposure recovered");
                if let Some(journal) = &self.journal {
                    journal.log_hedge(&self.symbol_perp, &order_id, hedge_qty, true, avg_px);
                }
                self.notify_progress(hedge_qty, avg_px);
                true
            }
            Err(VenueError::NotionalTooSmall) => {
                // Still below the venue floor; keep quoting so it can grow.
                self.accumulating.store(true, Ordering::SeqCst);
                warn!(naked, "recovery below venue notional floor, still accumulating");
                true
            }
            Err(e) => {
                error!(naked, error = %e, "naked-exposure recovery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::venues::sim::SimVenue;

    fn cfg(lot: f64) -> StrategyConfig {
        StrategyConfig {
            lot_size: lot,
            max_retry: 3,
            ..StrategyConfig::default()
        }
    }

    fn setup(lot: f64) -> (Arc<SimVenue>, Arc<EngineState>, Hedger) {
        let venue = Arc::new(SimVenue::new());
        let state = Arc::new(EngineState::new(1.0, FeeConfig::default()));
        let hedger = Hedger::new(venue.clone(), state.clone(), &cfg(lot), None, None);
        (venue, state, hedger)
    }

    #[tokio::test]
    async fn hedges_lot_multiple_and_carries_residual() {
        let (venue, state, hedger) = setup(0.001);
        let (ok, hedged) = hedger.try_hedge(0.0025).await;
        assert!(ok);
        assert!((hedged - 0.002).abs() < EPS);
        assert_eq!(venue.perp_sells().len(), 1);
        assert!((venue.perp_sells()[0].qty - 0.002).abs() < EPS);
        assert!((state.naked_exposure() - 0.0005).abs() < EPS);
        assert!(hedger.is_accumulating());
        let ledger = state.ledger();
        assert!((ledger.total_hedged_base - 0.002).abs() < EPS);
    }

    #[tokio::test]
    async fn sub_lot_quantity_is_carried_not_failed() {
        let (venue, state, hedger) = setup(0.001);
        let (ok, hedged) = hedger.try_hedge(0.0004).await;
        assert!(ok);
        assert_eq!(hedged, 0.0);
        assert!(venue.perp_sells().is_empty());
        assert!((state.naked_exposure() - 0.0004).abs() < EPS);

        // a second sub-lot fill pushes the total over the lot
        let (ok, hedged) = hedger.try_hedge(0.0007).await;
        assert!(ok);
        assert!((hedged - 0.001).abs() < EPS);
        assert!((state.naked_exposure() - 0.0001).abs() < EPS);
    }

    #[tokio::test]
    async fn notional_too_small_accumulates_without_retry() {
        let (venue, state, hedger) = setup(0.00005);
        venue.push_hedge_sell_error(VenueError::NotionalTooSmall);
        let (ok, hedged) = hedger.try_hedge(0.00005).await;
        assert!(!ok);
        assert_eq!(hedged, 0.0);
        // one attempt consumed the scripted error, no retries followed
        assert!(venue.perp_sells().is_empty());
        assert!((state.naked_exposure() - 0.00005).abs() < EPS);
        assert!(hedger.is_accumulating());
    }

    #[tokio::test]
    async fn aggregated_exposure_clears_in_one_sell() {
        let (venue, state, hedger) = setup(0.00005);
        // carried exposure from earlier notional-floor refusals
        state.lock().ledger.naked_exposure = 0.0499;
        let (ok, hedged) = hedger.try_hedge(0.0001).await;
        assert!(ok);
        assert!((hedged - 0.05).abs() < 1e-9);
        assert_eq!(venue.perp_sells().len(), 1);
        assert!(state.naked_exposure() < 1e-9);
        assert!(!hedger.is_accumulating());
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let (venue, _state, hedger) = setup(0.001);
        venue.push_hedge_sell_error(VenueError::Transient("503".into()));
        let (ok, hedged) = hedger.try_hedge(0.002).await;
        assert!(ok);
        assert!((hedged - 0.002).abs() < EPS);
        assert_eq!(venue.perp_sells().len(), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_escalates_to_naked() {
        let (venue, state, hedger) = setup(0.001);
        for _ in 0..3 {
            venue.push_hedge_sell_error(VenueError::Transient("503".into()));
        }
        let (ok, hedged) = hedger.try_hedge(0.002).await;
        assert!(!ok);
        assert_eq!(hedged, 0.0);
        assert!((state.naked_exposure() - 0.002).abs() < EPS);
        assert!(!hedger.is_accumulating());
    }

    #[tokio::test]
    async fn hedge_price_feeds_priced_totals() {
        let (venue, state, hedger) = setup(0.001);
        venue.set_hedge_avg_price(Some(100.5));
        hedger.try_hedge(0.002).await;
        let ledger = state.ledger();
        assert!((ledger.total_hedged_quote - 0.002 * 100.5).abs() < 1e-9);
        assert!((ledger.total_hedged_base_priced - 0.002).abs() < EPS);
    }

    #[tokio::test]
    async fn recover_sells_floored_naked() {
        let (venue, state, hedger) = setup(0.001);
        state.lock().ledger.naked_exposure = 0.0035;
        assert!(hedger.try_recover(0.5).await);
        assert_eq!(venue.perp_sells().len(), 1);
        assert!((venue.perp_sells()[0].qty - 0.003).abs() < EPS);
        assert!((state.naked_exposure() - 0.0005).abs() < EPS);
    }

    #[tokio::test]
    async fn recover_zeroes_dust_only_when_it_cannot_grow() {
        let (venue, state, hedger) = setup(0.001);
        state.lock().ledger.naked_exposure = 0.0004;

        // budget remains: dust is carried
        assert!(hedger.try_recover(0.5).await);
        assert!((state.naked_exposure() - 0.0004).abs() < EPS);

        // budget exhausted: dust is zeroed
        assert!(hedger.try_recover(0.0).await);
        assert_eq!(state.naked_exposure(), 0.0);
        assert!(venue.perp_sells().is_empty());
    }

    #[tokio::test]
    async fn recover_failure_reports_false() {
        let (venue, state, hedger) = setup(0.001);
        state.lock().ledger.naked_exposure = 0.002;
        for _ in 0..3 {
            venue.push_hedge_sell_error(VenueError::Transient("timeout".into()));
        }
        assert!(!hedger.try_recover(0.5).await);
        assert!((state.naked_exposure() - 0.002).abs() < EPS);
    }
}
