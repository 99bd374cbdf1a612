//! Engine entry point: load config, wire the venue gateway and websocket
//! feeds, start the control server, run the coordinator until a signal or
//! operator stop, then clean up.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use basisbot::config::{Config, Credentials};
use basisbot::control::{ControlContext, ControlServer};
use basisbot::engine::closer::CloseHandle;
use basisbot::engine::coordinator::Coordinator;
use basisbot::engine::fills::FillReconciler;
use basisbot::engine::hedger::Hedger;
use basisbot::engine::quoter::QuoteSynchronizer;
use basisbot::engine::state::EngineState;
use basisbot::journal::TradeJournal;
use basisbot::marketdata::{binance_ws, user_stream::UserStream, MarketCache};
use basisbot::notify::Notifier;
use basisbot::venues::binance::BinanceGateway;
use basisbot::venues::cross::CrossVenueGateway;
use basisbot::venues::VenueGateway;

/// Cross-venue deployments tighten the REST reconcile cadence because push
/// delivery across two venues is less reliable.
const CROSS_VENUE_RECONCILE_SECS: f64 = 2.0;

#[derive(Parser, Debug)]
#[command(name = "basisbot", about = "spot/perp basis market-making engine")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "basisbot.toml")]
    config: PathBuf,

    /// Override the account label used in the journal and notifications.
    #[arg(long)]
    account: Option<String>,

    /// Split-venue mode: spot leg and perp leg on different accounts.
    #[arg(long)]
    cross: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("config load failed: {}", cli.config.display()))?;
    if let Some(account) = cli.account {
        config.strategy.account_label = account;
    }
    if cli.cross {
        config.engine.cross_venue = true;
    }

    info!(
        symbol_spot = %config.strategy.symbol_spot,
        symbol_perp = %config.strategy.symbol_perp,
        budget = config.strategy.total_budget_base,
        cross_venue = config.engine.cross_venue,
        testnet = config.engine.testnet,
        "basisbot starting"
    );
    info!(
        maker_bps = config.fee.spot_maker_rate * 10_000.0,
        taker_bps = config.fee.perp_taker_rate * 10_000.0,
        net_cost_bps = config.fee.net_cost() * 10_000.0,
        min_profit_bps = config.fee.min_profit_bps,
        "fee model"
    );

    // ── market data + fill stream plumbing ──────────────────────────────

    let cache = MarketCache::new(std::time::Duration::from_secs_f64(
        config.engine.market_stale_secs,
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (fills_tx, fills_rx) =
        mpsc::channel(basisbot::marketdata::user_stream::FILL_CHANNEL_CAPACITY);

    // ── venue gateway ───────────────────────────────────────────────────

    let (venue, spot_api_key): (Arc<dyn VenueGateway>, String) = if config.engine.cross_venue {
        let spot_creds = Credentials::from_env("SPOT")?;
        let perp_creds = Credentials::from_env("PERP")?;
        let spot_key = spot_creds.api_key.clone();
        let spot = Arc::new(BinanceGateway::new(
            spot_creds.api_key,
            spot_creds.api_secret,
            config.engine.testnet,
            Some(cache.clone()),
        ));
        let perp = Arc::new(BinanceGateway::new(
            perp_creds.api_key,
            perp_creds.api_secret,
            config.engine.testnet,
            Some(cache.clone()),
        ));
        (Arc::new(CrossVenueGateway::new(spot, perp)), spot_key)
    } else {
        let creds = Credentials::from_env("BINANCE")?;
        let key = creds.api_key.clone();
        (
            Arc::new(BinanceGateway::new(
                creds.api_key,
                creds.api_secret,
                config.engine.testnet,
                Some(cache.clone()),
            )),
            key,
        )
    };

    // ── preflight: trust the venue over the config for precision ────────

    match venue
        .preflight_check(&config.strategy.symbol_spot, &config.strategy.symbol_perp)
        .await
    {
        Ok(info) => {
            if let Some(tick) = info.spot_tick_size {
                if (tick - config.strategy.tick_size_spot).abs() > 1e-12 {
                    warn!(
                        config_tick = config.strategy.tick_size_spot,
                        venue_tick = tick,
                        "configured tick size disagrees with the venue, fix the config"
                    );
                }
            }
            let promoted = [info.spot_lot_size, info.perp_lot_size]
                .into_iter()
                .flatten()
                .fold(config.strategy.lot_size, f64::max);
            if (promoted - config.strategy.lot_size).abs() > 1e-12 {
                warn!(
                    config_lot = config.strategy.lot_size,
                    promoted_lot = promoted,
                    "lot size promoted so both legs stay tradeable"
                );
                config.strategy.lot_size = promoted;
            }
        }
        Err(e) => warn!(error = %e, "preflight failed, continuing on configured precision"),
    }

    // ── websocket tasks ─────────────────────────────────────────────────

    tokio::spawn(binance_ws::run_spot_depth_stream(
        binance_ws::spot_depth_url(&config.strategy.symbol_spot, config.engine.testnet),
        cache.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(binance_ws::run_perp_book_stream(
        binance_ws::perp_book_url(&config.strategy.symbol_perp, config.engine.testnet),
        cache.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(
        UserStream::new(spot_api_key, config.engine.testnet).run(fills_tx, shutdown_rx.clone()),
    );

    // ── persistence + notifications ─────────────────────────────────────

    let journal = Some(Arc::new(TradeJournal::open(
        std::path::Path::new(&config.engine.journal_db),
        &config.strategy.account_label,
    )?));
    let notifier = Notifier::new(&config.engine.webhook_url, &config.strategy.account_label);
    if let Some(n) = &notifier {
        n.notify_start(&config.strategy.symbol_spot);
    }

    // ── engine core ─────────────────────────────────────────────────────

    let state = Arc::new(EngineState::new(
        config.strategy.total_budget_base,
        config.fee.clone(),
    ));
    let hedger = Arc::new(Hedger::new(
        venue.clone(),
        state.clone(),
        &config.strategy,
        journal.clone(),
        notifier.clone(),
    ));
    let pull_interval = if config.engine.cross_venue {
        std::time::Duration::from_secs_f64(
            config.strategy.rest_reconcile_secs.min(CROSS_VENUE_RECONCILE_SECS),
        )
    } else {
        config.strategy.rest_reconcile_interval()
    };
    let recon = FillReconciler::new(
        venue.clone(),
        state.clone(),
        hedger.clone(),
        journal.clone(),
        fills_rx,
        config.strategy.symbol_spot.clone(),
        config.strategy.lot_size,
        pull_interval,
    );
    let quoter = QuoteSynchronizer::new(
        venue.clone(),
        state.clone(),
        hedger.clone(),
        journal.clone(),
        config.strategy.clone(),
    );
    let coordinator = Coordinator::new(
        venue.clone(),
        state.clone(),
        hedger,
        quoter,
        recon,
        config.strategy.clone(),
    );

    // ── control surface ─────────────────────────────────────────────────

    let close = CloseHandle::new();
    let control = ControlServer::new(
        std::path::Path::new(&config.engine.control_socket),
        ControlContext {
            state: state.clone(),
            close,
            venue: venue.clone(),
            journal,
            notifier,
            cfg: config.strategy.clone(),
        },
    );
    tokio::spawn(control.run(shutdown_rx.clone()));

    // ── signals ─────────────────────────────────────────────────────────

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received, stopping"),
                _ = sigterm.recv() => info!("SIGTERM received, stopping"),
            }
            state.stop();
        });
    }

    info!("engine idle; send `start` on the control socket to begin quoting");

    // The coordinator owns the main loop and cleans up its ladder on exit.
    coordinator.run().await;

    let _ = shutdown_tx.send(true);
    info!("basisbot exited cleanly");
    Ok(())
}
