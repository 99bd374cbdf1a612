//! End-to-end engine scenarios driven through the sim venue: the ladder
//! happy path, notional-floor accumulation, drift, the spread guard, the
//! level-1 requote, and the close-task round trip.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use basisbot::config::{FeeConfig, StrategyConfig};
use basisbot::engine::closer::{CloseHandle, CloseTask};
use basisbot::engine::coordinator::Coordinator;
use basisbot::engine::fills::FillReconciler;
use basisbot::engine::hedger::Hedger;
use basisbot::engine::quoter::QuoteSynchronizer;
use basisbot::engine::state::EngineState;
use basisbot::models::{BookLevel, FillEvent, FillStatus};
use basisbot::venues::sim::SimVenue;
use basisbot::venues::{VenueError, VenueGateway};

const LOT: f64 = 0.00001;

fn strategy(lot: f64) -> StrategyConfig {
    StrategyConfig {
        total_budget_base: 1.0,
        lot_size: lot,
        min_order_qty: lot,
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

fn rig_with(cfg: StrategyConfig, pull_secs: f64) -> Rig {
    let venue = Arc::new(SimVenue::new());
    let state = Arc::new(EngineState::new(
        cfg.total_budget_base,
        FeeConfig::default(),
    ));
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
        Duration::from_secs_f64(pull_secs),
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

fn rig() -> Rig {
    rig_with(strategy(LOT), 3600.0)
}

fn seed_books(rig: &Rig) {
    rig.venue.set_spot_bids(vec![
        BookLevel::new(100.0, 10.0),
        BookLevel::new(99.9, 10.0),
        BookLevel::new(99.8, 10.0),
        BookLevel::new(99.7, 10.0),
        BookLevel::new(99.6, 10.0),
    ]);
    rig.venue.set_perp_top(100.5, 100.6);
}

fn fill(order_id: &str, cum: f64) -> FillEvent {
    FillEvent {
        order_id: order_id.to_string(),
        cum_filled_base: cum,
        last_fill_qty: cum,
        last_fill_px: 100.0,
        status: FillStatus::PartiallyFilled,
    }
}

// ── scenario 1: happy path ──────────────────────────────────────────────

#[tokio::test]
async fn happy_path_three_levels_then_hedged_fill() {
    let mut rig = rig();
    seed_books(&rig);

    rig.coord.tick().await.unwrap();

    let open = rig.venue.open_orders();
    assert_eq!(open.len(), 3);
    assert!((open[0].price - 100.0).abs() < 1e-12);
    assert!((open[1].price - 99.9).abs() < 1e-12);
    assert!((open[2].price - 99.8).abs() < 1e-12);
    assert!((open[0].qty - 0.002).abs() < 1e-9);
    assert!((open[1].qty - 0.003).abs() < 1e-9);
    assert!((open[2].qty - 0.005).abs() < 1e-9);

    // a single event reports 0.002 cumulative on the level-1 order
    let level1_id = open[0].id.clone();
    rig.fills_tx.send(fill(&level1_id, 0.002)).await.unwrap();
    rig.coord.tick().await.unwrap();

    let sells = rig.venue.perp_sells();
    assert_eq!(sells.len(), 1);
    assert!((sells[0].qty - 0.002).abs() < 1e-9);
    assert!(rig.state.naked_exposure() < 1e-12);

    let ledger = rig.state.ledger();
    assert!((ledger.total_filled_base - 0.002).abs() < 1e-9);
    assert!((ledger.total_filled_quote - 0.2).abs() < 1e-9);
    assert!((ledger.total_hedged_base - 0.002).abs() < 1e-9);
    assert!(rig.state.check_invariants(LOT).is_ok());
}

// ── scenario 2: hedge notional too small, then aggregated clear ─────────

#[tokio::test]
async fn notional_floor_accumulates_then_clears_in_one_sell() {
    const BIG_LOT: f64 = 0.00005;
    let mut rig = rig_with(strategy(BIG_LOT), 3600.0);
    seed_books(&rig);

    rig.coord.tick().await.unwrap();
    let ladder: Vec<String> = rig
        .venue
        .open_orders()
        .iter()
        .map(|o| o.id.clone())
        .collect();

    // first fill: the venue refuses the hedge as below its notional floor,
    // both on the initial attempt and on the same-tick recovery retry
    rig.venue.push_hedge_sell_error(VenueError::NotionalTooSmall);
    rig.venue.push_hedge_sell_error(VenueError::NotionalTooSmall);
    rig.fills_tx.send(fill(&ladder[0], BIG_LOT)).await.unwrap();
    rig.coord.tick().await.unwrap();

    assert!((rig.state.naked_exposure() - BIG_LOT).abs() < 1e-12);
    assert!(rig.venue.perp_sells().is_empty());
    // no retry storm, and the ladder is still quoting
    assert_eq!(rig.venue.open_orders().len(), 3);

    // recovery attempts also bounce off the floor without wedging anything
    rig.venue.push_hedge_sell_error(VenueError::NotionalTooSmall);
    rig.coord.tick().await.unwrap();
    assert!(rig.venue.perp_sells().is_empty());
    assert_eq!(rig.venue.open_orders().len(), 3);

    // a second fill lifts the aggregate over the floor: one sell clears it
    rig.fills_tx
        .send(fill(&ladder[1], 2.0 * BIG_LOT))
        .await
        .unwrap();
    rig.coord.tick().await.unwrap();

    let sells = rig.venue.perp_sells();
    assert_eq!(sells.len(), 1);
    assert!((sells[0].qty - 3.0 * BIG_LOT).abs() < 1e-12);
    assert!(rig.state.naked_exposure() < 1e-12);
    assert!(rig.state.check_invariants(BIG_LOT).is_ok());
}

// ── scenario 3: drift ───────────────────────────────────────────────────

#[tokio::test]
async fn drift_rebuilds_ladder_at_new_top_five() {
    let mut rig = rig();
    seed_books(&rig);
    rig.coord.tick().await.unwrap();
    let old_ids: Vec<String> = rig
        .venue
        .open_orders()
        .iter()
        .map(|o| o.id.clone())
        .collect();

    // the bid ladder walks up: former bid-1 price is now below bid-5
    rig.venue.set_spot_bids(vec![
        BookLevel::new(101.0, 10.0),
        BookLevel::new(100.9, 10.0),
        BookLevel::new(100.8, 10.0),
        BookLevel::new(100.7, 10.0),
        BookLevel::new(100.5, 10.0),
    ]);
    rig.venue.set_perp_top(101.5, 101.6);
    rig.coord.tick().await.unwrap();

    for id in &old_ids {
        assert!(rig.venue.order(id).unwrap().cancelled);
    }
    let open = rig.venue.open_orders();
    assert_eq!(open.len(), 3);
    assert!((open[0].price - 101.0).abs() < 1e-9);
    assert!((open[1].price - 100.9).abs() < 1e-9);
    assert!((open[2].price - 100.8).abs() < 1e-9);
}

// ── scenario 4: spread guard ────────────────────────────────────────────

#[tokio::test]
async fn spread_guard_cancels_and_hedges_captured_fills() {
    let mut rig = rig_with(strategy(LOT), 3600.0);
    seed_books(&rig);
    rig.state.set_manual_min_spread_bps(5.0);
    rig.coord.tick().await.unwrap();
    let ladder: Vec<String> = rig
        .venue
        .open_orders()
        .iter()
        .map(|o| o.id.clone())
        .collect();

    // a fill sneaks in right before the basis collapses
    rig.venue.set_filled(&ladder[0], 0.001);

    // perp bid drops: level-1 spread falls to ~3bp < 5bp floor
    rig.venue.set_perp_top(100.03, 100.13);
    rig.coord.tick().await.unwrap();

    // full cancel, captured fill hedged, no new quotes this tick
    assert!(rig.venue.open_orders().is_empty());
    assert!((rig.venue.total_perp_sold() - 0.001).abs() < 1e-9);
    let ledger = rig.state.ledger();
    assert!((ledger.total_filled_base - 0.001).abs() < 1e-9);
    assert!(rig.state.check_invariants(LOT).is_ok());
}

// ── scenario 5: level-1 fully fills ─────────────────────────────────────

#[tokio::test]
async fn level1_full_fill_forces_complete_requote() {
    let mut rig = rig();
    seed_books(&rig);
    rig.coord.tick().await.unwrap();
    let old_ids: Vec<String> = rig
        .venue
        .open_orders()
        .iter()
        .map(|o| o.id.clone())
        .collect();

    rig.fills_tx.send(fill(&old_ids[0], 0.002)).await.unwrap();
    rig.coord.tick().await.unwrap();

    // the whole ladder was cancelled and replaced, not topped up
    let open = rig.venue.open_orders();
    assert_eq!(open.len(), 3);
    for o in &open {
        assert!(!old_ids.contains(&o.id));
    }
    assert!((rig.venue.total_perp_sold() - 0.002).abs() < 1e-9);
    assert!(rig.state.check_invariants(LOT).is_ok());
}

// ── scenario 6: close-task round trip ───────────────────────────────────

#[tokio::test]
async fn close_task_round_trip() {
    let venue = Arc::new(SimVenue::new());
    venue.set_spot_asks(vec![
        BookLevel::new(101.0, 10.0),
        BookLevel::new(101.1, 10.0),
        BookLevel::new(101.2, 10.0),
        BookLevel::new(101.3, 10.0),
        BookLevel::new(101.4, 10.0),
    ]);
    venue.set_perp_top(100.4, 100.5);

    let state = Arc::new(EngineState::new(1.0, FeeConfig::default()));
    let handle = CloseHandle::new();
    assert!(handle.try_begin("BTCUSDT", 0.5));
    let task = CloseTask::new(
        venue.clone(),
        state.clone(),
        handle.clone(),
        None,
        None,
        strategy(LOT),
        "BTCUSDT".to_string(),
        0.5,
    );
    let worker = tokio::spawn(task.run());

    // sells rest on ask 2 and ask 3 with the 0.3 / 0.7 split
    let deadline = Instant::now() + Duration::from_secs(2);
    while venue.open_orders().len() < 2 {
        assert!(Instant::now() < deadline, "close orders never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sells = venue.open_orders();
    assert!((sells[0].price - 101.1).abs() < 1e-9);
    assert!((sells[0].qty - 0.15).abs() < 1e-6);
    assert!((sells[1].price - 101.2).abs() < 1e-9);
    assert!((sells[1].qty - 0.35).abs() < 1e-6);

    // as each sell fills, a matching perp buy follows
    venue.set_filled(&sells[0].id, 0.15);
    let deadline = Instant::now() + Duration::from_secs(2);
    while venue.total_perp_bought() < 0.15 - 1e-9 {
        assert!(Instant::now() < deadline, "perp buy-back never happened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    venue.set_filled(&sells[1].id, 0.35);

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.is_active() {
        assert!(Instant::now() < deadline, "close task never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.await.unwrap();

    let status = handle.snapshot();
    assert!((status.spot_sold - 0.5).abs() < 1e-9);
    assert!((status.perp_bought - 0.5).abs() < 1e-9);
    assert!(status.pending_hedge < LOT);
    assert!(status.msg.contains("target reached"));
}

// ── idempotence ─────────────────────────────────────────────────────────

#[tokio::test]
async fn double_cancel_is_one_success_one_noop() {
    let venue = SimVenue::new();
    let id = venue
        .place_spot_limit_buy("BTCUSDT", 100.0, 0.002)
        .await
        .unwrap();
    assert!(venue.cancel_order("BTCUSDT", &id).await.is_ok());
    assert!(venue.cancel_order("BTCUSDT", &id).await.is_ok());
    assert!(venue.order(&id).unwrap().cancelled);
}

#[tokio::test]
async fn unchanged_market_makes_ticks_noops() {
    let mut rig = rig();
    seed_books(&rig);
    rig.coord.tick().await.unwrap();

    let placed = rig.venue.orders().len();
    let cancels = rig.venue.cancel_count();
    for _ in 0..5 {
        rig.coord.tick().await.unwrap();
    }
    assert_eq!(rig.venue.orders().len(), placed);
    assert_eq!(rig.venue.cancel_count(), cancels);
}

// ── round-trip accounting property ──────────────────────────────────────

#[tokio::test]
async fn fill_sequence_round_trips_into_hedges() {
    let mut rig = rig();
    seed_books(&rig);
    rig.coord.tick().await.unwrap();
    let ladder: Vec<String> = rig
        .venue
        .open_orders()
        .iter()
        .map(|o| o.id.clone())
        .collect();

    // a staircase of cumulative events on level 2, summing to 0.003
    for cum in [0.0005, 0.0012, 0.003] {
        rig.fills_tx.send(fill(&ladder[1], cum)).await.unwrap();
        rig.coord.tick().await.unwrap();
    }

    let ledger = rig.state.ledger();
    assert!((ledger.total_filled_base - 0.003).abs() < 1e-9);
    // everything hedged modulo the lot floor carried as naked exposure
    assert!(
        (ledger.total_hedged_base + ledger.naked_exposure - 0.003).abs() < 1e-9
    );
    assert!(ledger.naked_exposure < LOT);
    assert!(rig.state.check_invariants(LOT).is_ok());
}

// ── pause property ──────────────────────────────────────────────────────

#[tokio::test]
async fn pause_empties_ladder_within_one_tick() {
    let mut rig = rig();
    seed_books(&rig);
    rig.coord.tick().await.unwrap();
    assert_eq!(rig.venue.open_orders().len(), 3);

    rig.state.pause();
    rig.coord.tick().await.unwrap();
    assert!(rig.venue.open_orders().is_empty());
    assert_eq!(rig.state.order_count(), 0);
}
