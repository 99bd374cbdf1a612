//! Top-level periodic loop: reconcile, recover, guard, select, converge,
//! reconcile again, sleep. One failed tick logs and backs off five poll
//! intervals; a stopped engine cancels everything on the way out.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::fills::FillReconciler;
use super::hedger::Hedger;
use super::quoter::QuoteSynchronizer;
use super::state::{EngineState, EPS};
use crate::config::StrategyConfig;
use crate::models::BookLevel;
use crate::venues::VenueGateway;

pub struct Coordinator {
    venue: Arc<dyn VenueGateway>,
    state: Arc<EngineState>,
    hedger: Arc<Hedger>,
    quoter: QuoteSynchronizer,
    recon: FillReconciler,
    cfg: StrategyConfig,
}

impl Coordinator {
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        state: Arc<EngineState>,
        hedger: Arc<Hedger>,
        quoter: QuoteSynchronizer,
        recon: FillReconciler,
        cfg: StrategyConfig,
    ) -> Self {
        Self {
            venue,
            state,
            hedger,
            quoter,
            recon,
            cfg,
        }
    }

    async fn sleep_tick(&self) {
        tokio::time::sleep(self.cfg.poll_interval()).await;
    }

    /// Whether any live quote's basis has collapsed below the floor.
    fn spread_violated(&self, perp_bid: f64) -> bool {
        let min_spread = self.state.min_spread();
        let inner = self.state.lock();
        inner
            .active_orders
            .values()
            .any(|o| (perp_bid - o.price) / o.price < min_spread)
    }

    /// Whether the visible bid ladder has walked above any live quote.
    fn drifted(&self, spot_bids: &[BookLevel]) -> bool {
        let Some(deepest) = spot_bids.get(4) else {
            return false;
        };
        let inner = self.state.lock();
        inner
            .active_orders
            .values()
            .any(|o| o.price < deepest.price)
    }

    /// One coordinator tick. Every exit path has slept once.
    pub async fn tick(&mut self) -> Result<()> {
        // Paused: keep nothing resting on the book.
        if self.state.is_paused() {
            if self.state.order_count() > 0 {
                info!("paused, clearing ladder");
                self.quoter.cancel_all(&mut self.recon).await;
            }
            self.sleep_tick().await;
            return Ok(());
        }

        // Catch fills before acting on stale state.
        for closed in self.recon.tick().await {
            debug!(level = closed.level, order_id = %closed.order_id, "order closed");
        }

        // Naked exposure gets recovered before any new capital commits.
        if self.state.naked_exposure() > EPS {
            let remaining = {
                let inner = self.state.lock();
                (inner.total_budget_base - inner.ledger.total_filled_base).max(0.0)
            };
            if !self.hedger.try_recover(remaining).await {
                warn!("recovery failed, entering protective mode");
                self.quoter.cancel_all(&mut self.recon).await;
                self.sleep_tick().await;
                return Ok(());
            }
        }

        // Market data; missing either side means we sit this tick out.
        let perp_bid = match self.venue.get_futures_best_bid(&self.cfg.symbol_perp).await {
            Ok(bid) if bid > 0.0 => bid,
            Ok(_) | Err(_) => {
                debug!("perp bid unavailable");
                self.sleep_tick().await;
                return Ok(());
            }
        };
        let spot_bids = match self.venue.get_spot_depth(&self.cfg.symbol_spot, 5).await {
            Ok(bids) if !bids.is_empty() => bids,
            Ok(_) | Err(_) => {
                debug!("spot depth unavailable");
                self.sleep_tick().await;
                return Ok(());
            }
        };

        // Spread guard: basis collapsed, exit even competitive quotes now.
        if self.spread_violated(perp_bid) {
            warn!(perp_bid, "spread guard tripped, cancelling ladder");
            self.quoter.cancel_all(&mut self.recon).await;
            self.sleep_tick().await;
            return Ok(());
        }

        // Drift guard: quotes fell below the visible top 5; refresh them.
        if self.drifted(&spot_bids) {
            info!("drift detected, rebuilding ladder");
            self.quoter.cancel_all(&mut self.recon).await;
        }

        // Level-1 fill requested a full rebuild around the new top.
        if self.state.take_requote_all() {
            info!("level-1 filled, requoting all levels");
            self.quoter.cancel_all(&mut self.recon).await;
        }

        let desired = self.quoter.select(perp_bid, &spot_bids);
        if desired.is_empty() {
            // No workable ladder. Existing orders stay (transient dips must
            // not thrash; the guards above own cancellation).
            self.sleep_tick().await;
            return Ok(());
        }

        if !self.quoter.sync(&mut self.recon, &desired).await {
            self.sleep_tick().await;
            return Ok(());
        }

        // Catch fills that landed between place and now.
        self.recon.tick().await;

        self.sleep_tick().await;
        Ok(())
    }

    /// Runs until the engine stops, then cancels everything on the way out.
    pub async fn run(mut self) {
        info!(
            symbol_spot = %self.cfg.symbol_spot,
            symbol_perp = %self.cfg.symbol_perp,
            budget = self.state.budget(),
            min_spread_bps = self.state.min_spread_bps(),
            "coordinator started"
        );

        while self.state.is_running() {
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed, backing off");
                tokio::time::sleep(self.cfg.poll_interval() * 5).await;
            }
            if let Err(violation) = self.state.check_invariants(self.cfg.lot_size) {
                error!(violation, "engine invariant violated");
            }
        }

        info!("coordinator stopping, clearing ladder");
        self.quoter.cancel_all(&mut self.recon).await;
        let naked = self.state.naked_exposure();
        if naked > EPS {
            error!(naked, "CRITICAL: residual naked exposure at shutdown, manual action required");
        }
        info!("coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::models::{FillEvent, FillStatus};
    use crate::venues::sim::SimVenue;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LOT: f64 = 0.00001;

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            total_budget_base: 1.0,
            lot_size: LOT,
            min_order_qty: LOT,
            min_notional_quote: 0.0,
            tick_size_spot: 0.01,
            poll_interval_secs: 0.001,
            ..StrategyConfig::default()
        }
    }

    struct Rig {
        venue: Arc<SimVenue>,
        state: Arc<EngineState>,
        coord: Coordinator,
        fills_tx: mpsc::Sender<FillEvent>,
    }

    fn rig() -> Rig {
        let cfg = cfg();
        let venue = Arc::new(SimVenue::new());
        let state = Arc::new(EngineState::new(cfg.total_budget_base, FeeConfig::default()));
        state.resume();
        let hedger = Arc::new(Hedger::new(venue.clone(), state.clone(), &cfg, None, None));
        let (fills_tx, fills_rx) = mpsc::channel(64);
        let recon = FillReconciler::new(
            venue.clone(),
            state.clone(),
            hedger.clone(),
            None,
            fills_rx,
            cfg.symbol_spot.clone(),
            cfg.lot_size,
            Duration::from_secs(3600),
        );
        let quoter = QuoteSynchronizer::new(
            venue.clone(),
            state.clone(),
            hedger.clone(),
            None,
            cfg.clone(),
        );
        let coord = Coordinator::new(venue.clone(), state.clone(), hedger, quoter, recon, cfg);
        Rig {
            venue,
            state,
            coord,
            fills_tx,
        }
    }

    fn book(rig: &Rig) {
        rig.venue.set_spot_bids(vec![
            BookLevel::new(100.0, 10.0),
            BookLevel::new(99.9, 10.0),
            BookLevel::new(99.8, 10.0),
            BookLevel::new(99.7, 10.0),
            BookLevel::new(99.6, 10.0),
        ]);
        rig.venue.set_perp_top(100.5, 100.6);
    }

    #[tokio::test]
    async fn happy_path_places_ladder_and_hedges_fill() {
        let mut rig = rig();
        book(&rig);

        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);
        let orders = rig.venue.open_orders();
        assert!((orders[0].qty - 0.002).abs() < 1e-9);
        assert!((orders[1].qty - 0.003).abs() < 1e-9);
        assert!((orders[2].qty - 0.005).abs() < 1e-9);

        // partial fill on level 1
        let level1 = rig.state.ladder()[0].1.clone();
        rig.fills_tx
            .send(FillEvent {
                order_id: level1,
                cum_filled_base: 0.002,
                last_fill_qty: 0.002,
                last_fill_px: 100.0,
                status: FillStatus::Filled,
            })
            .await
            .unwrap();
        rig.coord.tick().await.unwrap();

        assert!((rig.venue.total_perp_sold() - 0.002).abs() < 1e-9);
        assert!(rig.state.naked_exposure() < EPS);
        let ledger = rig.state.ledger();
        assert!((ledger.total_filled_base - 0.002).abs() < 1e-9);
        assert!(rig.state.check_invariants(LOT).is_ok());
    }

    #[tokio::test]
    async fn spread_guard_cancels_without_requoting() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);

        // basis collapses: min spread is 2bp, level-1 spread goes negative
        rig.venue.set_perp_top(99.9, 100.0);
        rig.coord.tick().await.unwrap();

        assert_eq!(rig.state.ladder().len(), 0);
        assert!(rig.venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn drift_guard_cancels_and_requotes_same_tick() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();
        let old_ids: Vec<String> =
            rig.state.ladder().iter().map(|(_, id)| id.clone()).collect();

        // whole book walks up past our quotes
        rig.venue.set_spot_bids(vec![
            BookLevel::new(100.6, 10.0),
            BookLevel::new(100.55, 10.0),
            BookLevel::new(100.52, 10.0),
            BookLevel::new(100.51, 10.0),
            BookLevel::new(100.5, 10.0),
        ]);
        rig.venue.set_perp_top(101.1, 101.2);
        rig.coord.tick().await.unwrap();

        let ladder = rig.state.ladder();
        assert_eq!(ladder.len(), 3);
        assert!(ladder.iter().all(|(_, id)| !old_ids.contains(id)));
        let open = rig.venue.open_orders();
        assert!((open[0].price - 100.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn level1_full_fill_rebuilds_whole_ladder() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();
        let old_ids: Vec<String> =
            rig.state.ladder().iter().map(|(_, id)| id.clone()).collect();
        let level1 = old_ids[0].clone();

        rig.fills_tx
            .send(FillEvent {
                order_id: level1,
                cum_filled_base: 0.002,
                last_fill_qty: 0.002,
                last_fill_px: 100.0,
                status: FillStatus::Filled,
            })
            .await
            .unwrap();
        rig.coord.tick().await.unwrap();

        // whole ladder rebuilt, not a partial top-up
        let ladder = rig.state.ladder();
        assert_eq!(ladder.len(), 3);
        assert!(ladder.iter().all(|(_, id)| !old_ids.contains(id)));
        assert!(!rig.state.take_requote_all());
    }

    #[tokio::test]
    async fn pause_clears_ladder_within_one_tick() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);

        rig.state.pause();
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 0);
        assert!(rig.venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn missing_market_data_keeps_existing_orders() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);

        // wipe the books but keep the basis fine on the last known quotes
        rig.venue.set_spot_bids(vec![]);
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);
    }

    #[tokio::test]
    async fn empty_desired_with_live_ladder_keeps_orders() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();

        // book too shallow for a full ladder: selection aborts, but the
        // live orders still pass both guards and must survive
        rig.venue.set_spot_bids(vec![
            BookLevel::new(100.0, 10.0),
            BookLevel::new(99.9, 10.0),
        ]);
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);
    }

    #[tokio::test]
    async fn recovery_failure_enters_protective_mode() {
        let mut rig = rig();
        book(&rig);
        rig.coord.tick().await.unwrap();
        assert_eq!(rig.state.ladder().len(), 3);

        rig.state.lock().ledger.naked_exposure = 0.002;
        for _ in 0..3 {
            rig.venue
                .push_hedge_sell_error(crate::venues::VenueError::Transient("down".into()));
        }
        rig.coord.tick().await.unwrap();

        // ladder torn down, no quotes while exposure is unrecovered
        assert_eq!(rig.state.ladder().len(), 0);
        assert!((rig.state.naked_exposure() - 0.002).abs() < 1e-9);
    }
}
