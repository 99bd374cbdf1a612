//! Venue gateway abstraction.
//!
//! One capability set — market data, spot orders, perp orders, position
//! queries — behind a single trait, whether both legs live on one exchange
//! or are split across two. The engine core never knows the difference.

pub mod binance;
pub mod cross;
pub mod rate_limit;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::BookLevel;

/// Sentinel returned by [`VenueGateway::get_order_filled_qty`] when the venue
/// no longer knows the order (purged after fill or cancel).
pub const FILLED_QTY_UNKNOWN: f64 = -1.0;

/// Venue-call failure taxonomy. The engine branches on these variants; free
/// text stays inside them for logging only.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Network error, 5xx, or venue-side hiccup. Worth retrying.
    #[error("transient venue failure: {0}")]
    Transient(String),

    /// The 10s call deadline elapsed. Treated like a transient failure.
    #[error("venue call timed out")]
    Timeout,

    /// Cancel target already gone. Callers treat this as success.
    #[error("unknown order: {0}")]
    UnknownOrder(String),

    /// Query target not found (purged). Mapped to the filled-qty sentinel.
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// The venue refused the order for being below its notional floor.
    /// Never retried — the quantity is carried until it grows.
    #[error("order notional below venue minimum")]
    NotionalTooSmall,

    /// Any other venue rejection (bad symbol, insufficient balance, ...).
    #[error("venue rejected request: {0}")]
    Rejected(String),

    /// The gateway does not support this operation (e.g. internal transfer
    /// in cross-venue mode).
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl VenueError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Transient(_) | VenueError::Timeout)
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Direction of an internal wallet transfer on a single venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    SpotToPerp,
    PerpToSpot,
}

impl TransferDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spot_to_perp" | "to_perp" => Some(Self::SpotToPerp),
            "perp_to_spot" | "to_spot" => Some(Self::PerpToSpot),
            _ => None,
        }
    }
}

/// Tick/lot sizes reported by the venue at startup. Any field may be missing
/// when the corresponding exchangeInfo call failed; the preflight is advisory.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreflightInfo {
    pub spot_tick_size: Option<f64>,
    pub spot_lot_size: Option<f64>,
    pub perp_tick_size: Option<f64>,
    pub perp_lot_size: Option<f64>,
}

/// Uniform order-lifecycle and market-data contract over one or two venues.
///
/// All calls are subject to a 10s deadline inside the implementation;
/// timeouts surface as [`VenueError::Timeout`].
#[async_trait]
pub trait VenueGateway: Send + Sync {
    async fn get_futures_best_bid(&self, symbol: &str) -> VenueResult<f64>;
    async fn get_futures_best_ask(&self, symbol: &str) -> VenueResult<f64>;

    /// Spot bids, best first, up to `levels` deep.
    async fn get_spot_depth(&self, symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>>;
    /// Spot asks, best first, up to `levels` deep.
    async fn get_spot_asks(&self, symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>>;

    async fn place_spot_limit_buy(&self, symbol: &str, price: f64, qty: f64)
        -> VenueResult<String>;
    async fn place_spot_limit_sell(&self, symbol: &str, price: f64, qty: f64)
        -> VenueResult<String>;

    /// Idempotent: cancelling an order the venue no longer knows is success.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()>;

    /// Cumulative filled base quantity, or [`FILLED_QTY_UNKNOWN`] when the
    /// order has been purged venue-side.
    async fn get_order_filled_qty(&self, symbol: &str, order_id: &str) -> VenueResult<f64>;

    async fn place_futures_market_sell(&self, symbol: &str, qty: f64) -> VenueResult<String>;
    async fn place_futures_market_buy(&self, symbol: &str, qty: f64) -> VenueResult<String>;

    /// Signed perp position in base units (negative = short).
    async fn get_futures_position(&self, symbol: &str) -> VenueResult<f64>;

    /// Average fill price of the most recent futures market order, when the
    /// venue reported one. Delivered out-of-band because market-order
    /// responses may omit it.
    fn last_hedge_avg_price(&self) -> Option<f64>;

    /// Move margin between the spot and perp wallets of a single venue.
    async fn internal_transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> VenueResult<()>;

    /// Startup sanity check returning venue precision for both legs.
    async fn preflight_check(&self, symbol_spot: &str, symbol_perp: &str)
        -> VenueResult<PreflightInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(VenueError::Transient("503".into()).is_retryable());
        assert!(VenueError::Timeout.is_retryable());
        assert!(!VenueError::NotionalTooSmall.is_retryable());
        assert!(!VenueError::Rejected("bad qty".into()).is_retryable());
        assert!(!VenueError::UnknownOrder("1".into()).is_retryable());
    }

    #[test]
    fn transfer_direction_parses_aliases() {
        assert_eq!(
            TransferDirection::parse("spot_to_perp"),
            Some(TransferDirection::SpotToPerp)
        );
        assert_eq!(
            TransferDirection::parse("to_spot"),
            Some(TransferDirection::PerpToSpot)
        );
        assert_eq!(TransferDirection::parse("sideways"), None);
    }
}
