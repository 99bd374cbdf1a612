//! Configuration loading: API credentials from `.env`, strategy/fee/engine
//! parameters from a TOML file.
//!
//! A bad or missing config is fatal at startup — the engine refuses to trade
//! on defaults it cannot trust.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Fee model for the spot-maker / perp-taker round trip.
///
/// The maker rate is negative when the venue pays a rebate. The minimum
/// acceptable basis is `net_cost + min_profit_bps`, unless the operator has
/// pinned a manual value at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Spot maker fee rate (negative = rebate).
    pub spot_maker_rate: f64,
    /// Perp taker fee rate.
    pub perp_taker_rate: f64,
    /// Minimum profit on top of fees, in basis points. May be negative.
    pub min_profit_bps: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            spot_maker_rate: -0.00025,
            perp_taker_rate: 0.0004,
            min_profit_bps: 0.5,
        }
    }
}

impl FeeConfig {
    /// Net fee cost of one unit round trip, as a fraction.
    pub fn net_cost(&self) -> f64 {
        self.perp_taker_rate + self.spot_maker_rate
    }

    /// The auto-mode minimum spread fraction: fees plus required profit.
    pub fn auto_min_spread(&self) -> f64 {
        self.net_cost() + self.min_profit_bps / 10_000.0
    }
}

/// Strategy parameters. Immutable per run except where the engine exposes a
/// guarded setter (budget, manual spread).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub symbol_spot: String,
    pub symbol_perp: String,
    /// Spot price increment.
    pub tick_size_spot: f64,
    /// Base quantity increment; effectively `max(spot_lot, perp_lot)` after
    /// the startup preflight promotes it.
    pub lot_size: f64,
    /// Total inventory to acquire, in base units.
    pub total_budget_base: f64,
    /// Fraction of the total budget targeted per tick.
    pub cycle_budget_fraction: f64,
    /// Max fraction of a book level's visible size we will consume.
    pub depth_consumption_ratio: f64,
    pub min_order_qty: f64,
    /// Venue minimum notional per order, in quote units.
    pub min_notional_quote: f64,
    /// Reprice when the price moves this many bps...
    pub reprice_threshold_bps: f64,
    /// ...or at least this many ticks, whichever is larger.
    pub reprice_tick_floor: f64,
    /// Coordinator tick cadence, seconds.
    pub poll_interval_secs: f64,
    pub max_retry: u32,
    /// Periodic REST fill reconciliation cadence, seconds. Tightened in
    /// cross-venue mode where push delivery is less reliable.
    pub rest_reconcile_secs: f64,
    /// Tag attached to journal rows and notification messages.
    pub account_label: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol_spot: "BTCUSDT".to_string(),
            symbol_perp: "BTCUSDT".to_string(),
            tick_size_spot: 0.01,
            lot_size: 0.00001,
            total_budget_base: 0.0,
            cycle_budget_fraction: 0.01,
            depth_consumption_ratio: 0.3,
            min_order_qty: 0.00001,
            min_notional_quote: 5.5,
            reprice_threshold_bps: 0.5,
            reprice_tick_floor: 3.0,
            poll_interval_secs: 0.2,
            max_retry: 3,
            rest_reconcile_secs: 10.0,
            account_label: String::new(),
        }
    }
}

impl StrategyConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn rest_reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.rest_reconcile_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.symbol_spot.is_empty() || self.symbol_perp.is_empty() {
            bail!("symbol_spot / symbol_perp must be set");
        }
        if self.lot_size <= 0.0 {
            bail!("lot_size must be > 0 (got {})", self.lot_size);
        }
        if self.tick_size_spot <= 0.0 {
            bail!("tick_size_spot must be > 0 (got {})", self.tick_size_spot);
        }
        if self.total_budget_base < 0.0 {
            bail!("total_budget_base must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.cycle_budget_fraction) {
            bail!("cycle_budget_fraction must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.depth_consumption_ratio) {
            bail!("depth_consumption_ratio must be in [0, 1]");
        }
        if self.poll_interval_secs <= 0.0 {
            bail!("poll_interval_secs must be > 0");
        }
        Ok(())
    }
}

/// Engine-level wiring that is not strategy math.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unix-domain socket path for the operator control channel.
    pub control_socket: String,
    /// SQLite trade journal path.
    pub journal_db: String,
    /// Optional webhook URL for notifications (empty = disabled).
    pub webhook_url: String,
    /// Use venue testnet endpoints.
    pub testnet: bool,
    /// Split-venue mode: spot on one exchange, perp on another.
    pub cross_venue: bool,
    /// Market-data staleness threshold, seconds.
    pub market_stale_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_socket: "/tmp/basisbot.sock".to_string(),
            journal_db: "trades.db".to_string(),
            webhook_url: String::new(),
            testnet: false,
            cross_venue: false,
            market_stale_secs: 5.0,
        }
    }
}

/// API credentials, read from the environment (`.env` supported).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Reads `<PREFIX>_API_KEY` / `<PREFIX>_API_SECRET`.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let key_var = format!("{prefix}_API_KEY");
        let secret_var = format!("{prefix}_API_SECRET");
        let api_key = std::env::var(&key_var)
            .with_context(|| format!("missing {key_var} in environment"))?;
        let api_secret = std::env::var(&secret_var)
            .with_context(|| format!("missing {secret_var} in environment"))?;
        if api_key.is_empty() || api_secret.is_empty() {
            bail!("{key_var} / {secret_var} must be non-empty");
        }
        Ok(Self { api_key, api_secret })
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strategy: StrategyConfig,
    pub fee: FeeConfig,
    pub engine: EngineConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        cfg.strategy.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_defaults_compose() {
        let fee = FeeConfig::default();
        // 0.04% taker - 0.025% maker rebate = 1.5bp net cost
        assert!((fee.net_cost() - 0.00015).abs() < 1e-12);
        // plus 0.5bp minimum profit = 2bp
        assert!((fee.auto_min_spread() - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn parse_minimal_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [strategy]
            symbol_spot = "ETHUSDT"
            symbol_perp = "ETHUSDT"
            total_budget_base = 2.5

            [fee]
            min_profit_bps = 1.0

            [engine]
            cross_venue = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.strategy.symbol_spot, "ETHUSDT");
        assert!((cfg.strategy.total_budget_base - 2.5).abs() < 1e-12);
        assert!((cfg.fee.min_profit_bps - 1.0).abs() < 1e-12);
        assert!(cfg.engine.cross_venue);
        // untouched fields keep defaults
        assert!((cfg.strategy.cycle_budget_fraction - 0.01).abs() < 1e-12);
    }

    #[test]
    fn validation_rejects_zero_lot() {
        let mut cfg = StrategyConfig::default();
        cfg.lot_size = 0.0;
        assert!(cfg.validate().is_err());
    }
}
