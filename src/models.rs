//! Shared domain types used across the engine, venues and control surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One price level of an order book side: `(price, visible size)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Order side, spot or perp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Order lifecycle status as reported by the user-data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl FillStatus {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Normalized fill event from the user-data websocket.
///
/// `cum_filled_base` is cumulative, not incremental — consumers must diff
/// against their own per-order accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub cum_filled_base: f64,
    pub last_fill_qty: f64,
    pub last_fill_px: f64,
    pub status: FillStatus,
}

/// Emitted by the fill reconciler when an order is fully filled and fully
/// hedged. The coordinator consumes these to prune the ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderClosed {
    pub order_id: String,
    pub level: u8,
}

/// One row of the live ladder as shown in `status` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOrderView {
    pub level: u8,
    /// Where the order price currently sits in the visible book (None =
    /// below the top 5).
    pub current_level: Option<u8>,
    pub id: String,
    pub price: f64,
    pub qty: f64,
    pub filled: f64,
    pub hedged: f64,
}

/// Close-task progress snapshot, readable while the task runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseStatus {
    pub running: bool,
    pub paused: bool,
    pub symbol: String,
    pub target_qty: f64,
    pub spot_sold: f64,
    pub perp_bought: f64,
    pub pending_hedge: f64,
    pub spot_sold_quote: f64,
    pub perp_bought_quote: f64,
    pub open_orders: Vec<CloseOrderView>,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseOrderView {
    pub id: String,
    pub price: f64,
    pub qty: f64,
    pub filled: f64,
}

/// Full engine status as returned by the `status` control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub paused: bool,
    pub running: bool,
    pub symbol_spot: String,
    pub symbol_perp: String,
    pub budget: f64,
    pub used: f64,
    pub remaining: f64,
    pub spot_filled_base: f64,
    pub perp_hedged_base: f64,
    pub naked_exposure: f64,
    pub spot_avg_price: Option<f64>,
    pub perp_avg_price: Option<f64>,
    pub perp_avg_priced_base: f64,
    pub min_profit_bps: f64,
    pub min_spread_bps: f64,
    pub spread_mode: String,
    pub active_orders: Vec<ActiveOrderView>,
    pub close_task: CloseStatus,
}

/// Append-only journal record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStatus {
    Placed,
    Filled,
    HedgeOk,
    HedgeFail,
    ClosePlaced,
    CloseFilled,
}

impl JournalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Placed => "placed",
            Self::Filled => "filled",
            Self::HedgeOk => "hedge_ok",
            Self::HedgeFail => "hedge_fail",
            Self::ClosePlaced => "close_placed",
            Self::CloseFilled => "close_filled",
        }
    }
}

/// A journal row read back via `recent_trades`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub side: String,
    pub symbol: String,
    pub order_id: String,
    pub price: Option<f64>,
    pub qty: f64,
    pub status: String,
    pub account: String,
}
