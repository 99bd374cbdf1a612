//! Scriptable in-memory venue for tests.
//!
//! Books, fills, failures and hedge prices are all injected by the test;
//! every order-lifecycle call is recorded so assertions can replay exactly
//! what the engine did.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{
    PreflightInfo, TransferDirection, VenueError, VenueGateway, VenueResult, FILLED_QTY_UNKNOWN,
};
use crate::models::{BookLevel, Side};

/// A spot order as the sim venue recorded it.
#[derive(Debug, Clone)]
pub struct SimOrder {
    pub id: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub filled: f64,
    pub cancelled: bool,
    pub purged: bool,
}

/// A perp market order as the sim venue recorded it.
#[derive(Debug, Clone, Copy)]
pub struct SimPerpOrder {
    pub qty: f64,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    spot_bids: Vec<BookLevel>,
    spot_asks: Vec<BookLevel>,
    perp_bid: f64,
    perp_ask: f64,
    orders: Vec<SimOrder>,
    perp_sells: Vec<SimPerpOrder>,
    perp_buys: Vec<SimPerpOrder>,
    perp_position: f64,
    hedge_avg_price: Option<f64>,
    /// Errors consumed, in order, by the next perp sell calls.
    hedge_sell_errors: VecDeque<VenueError>,
    /// Errors consumed, in order, by the next spot placement calls.
    place_errors: VecDeque<VenueError>,
    cancel_count: u32,
    transfers: Vec<(String, f64, TransferDirection)>,
    preflight: PreflightInfo,
}

pub struct SimVenue {
    state: Mutex<SimState>,
}

impl Default for SimVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVenue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    // ── scripting ───────────────────────────────────────────────────────

    pub fn set_spot_bids(&self, bids: Vec<BookLevel>) {
        self.state.lock().spot_bids = bids;
    }

    pub fn set_spot_asks(&self, asks: Vec<BookLevel>) {
        self.state.lock().spot_asks = asks;
    }

    pub fn set_perp_top(&self, bid: f64, ask: f64) {
        let mut st = self.state.lock();
        st.perp_bid = bid;
        st.perp_ask = ask;
    }

    pub fn set_hedge_avg_price(&self, px: Option<f64>) {
        self.state.lock().hedge_avg_price = px;
    }

    pub fn set_perp_position(&self, amt: f64) {
        self.state.lock().perp_position = amt;
    }

    /// Queue an error for the next perp market sell.
    pub fn push_hedge_sell_error(&self, err: VenueError) {
        self.state.lock().hedge_sell_errors.push_back(err);
    }

    /// Queue an error for the next spot limit order placement.
    pub fn push_place_error(&self, err: VenueError) {
        self.state.lock().place_errors.push_back(err);
    }

    /// Script a cumulative fill on an order (what REST polling will see).
    pub fn set_filled(&self, order_id: &str, cum_filled: f64) {
        let mut st = self.state.lock();
        if let Some(o) = st.orders.iter_mut().find(|o| o.id == order_id) {
            o.filled = cum_filled;
        }
    }

    /// Make the venue forget the order: queries return the sentinel.
    pub fn purge_order(&self, order_id: &str) {
        let mut st = self.state.lock();
        if let Some(o) = st.orders.iter_mut().find(|o| o.id == order_id) {
            o.purged = true;
        }
    }

    pub fn set_preflight(&self, info: PreflightInfo) {
        self.state.lock().preflight = info;
    }

    // ── assertions ──────────────────────────────────────────────────────

    pub fn orders(&self) -> Vec<SimOrder> {
        self.state.lock().orders.clone()
    }

    pub fn open_orders(&self) -> Vec<SimOrder> {
        self.state
            .lock()
            .orders
            .iter()
            .filter(|o| !o.cancelled)
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<SimOrder> {
        self.state
            .lock()
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
    }

    pub fn perp_sells(&self) -> Vec<SimPerpOrder> {
        self.state.lock().perp_sells.clone()
    }

    pub fn perp_buys(&self) -> Vec<SimPerpOrder> {
        self.state.lock().perp_buys.clone()
    }

    pub fn total_perp_sold(&self) -> f64 {
        self.state.lock().perp_sells.iter().map(|o| o.qty).sum()
    }

    pub fn total_perp_bought(&self) -> f64 {
        self.state.lock().perp_buys.iter().map(|o| o.qty).sum()
    }

    pub fn cancel_count(&self) -> u32 {
        self.state.lock().cancel_count
    }

    pub fn transfers(&self) -> Vec<(String, f64, TransferDirection)> {
        self.state.lock().transfers.clone()
    }

    fn place(&self, side: Side, price: f64, qty: f64) -> VenueResult<String> {
        let mut st = self.state.lock();
        if let Some(err) = st.place_errors.pop_front() {
            return Err(err);
        }
        st.next_id += 1;
        let id = st.next_id.to_string();
        st.orders.push(SimOrder {
            id: id.clone(),
            side,
            price,
            qty,
            filled: 0.0,
            cancelled: false,
            purged: false,
        });
        Ok(id)
    }
}

#[async_trait]
impl VenueGateway for SimVenue {
    async fn get_futures_best_bid(&self, _symbol: &str) -> VenueResult<f64> {
        Ok(self.state.lock().perp_bid)
    }

    async fn get_futures_best_ask(&self, _symbol: &str) -> VenueResult<f64> {
        Ok(self.state.lock().perp_ask)
    }

    async fn get_spot_depth(&self, _symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>> {
        Ok(self.state.lock().spot_bids.iter().take(levels).copied().collect())
    }

    async fn get_spot_asks(&self, _symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>> {
        Ok(self.state.lock().spot_asks.iter().take(levels).copied().collect())
    }

    async fn place_spot_limit_buy(&self, _symbol: &str, price: f64, qty: f64)
        -> VenueResult<String> {
        self.place(Side::Buy, price, qty)
    }

    async fn place_spot_limit_sell(&self, _symbol: &str, price: f64, qty: f64)
        -> VenueResult<String> {
        self.place(Side::Sell, price, qty)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> VenueResult<()> {
        let mut st = self.state.lock();
        st.cancel_count += 1;
        if let Some(o) = st.orders.iter_mut().find(|o| o.id == order_id) {
            o.cancelled = true;
        }
        // unknown order: idempotent success, same as the live gateway
        Ok(())
    }

    async fn get_order_filled_qty(&self, _symbol: &str, order_id: &str) -> VenueResult<f64> {
        let st = self.state.lock();
        match st.orders.iter().find(|o| o.id == order_id) {
            Some(o) if o.purged => Ok(FILLED_QTY_UNKNOWN),
            Some(o) => Ok(o.filled),
            None => Ok(FILLED_QTY_UNKNOWN),
        }
    }

    async fn place_futures_market_sell(&self, _symbol: &str, qty: f64) -> VenueResult<String> {
        let mut st = self.state.lock();
        if let Some(err) = st.hedge_sell_errors.pop_front() {
            return Err(err);
        }
        st.perp_sells.push(SimPerpOrder { qty });
        st.perp_position -= qty;
        st.next_id += 1;
        Ok(format!("perp-{}", st.next_id))
    }

    async fn place_futures_market_buy(&self, _symbol: &str, qty: f64) -> VenueResult<String> {
        let mut st = self.state.lock();
        st.perp_buys.push(SimPerpOrder { qty });
        st.perp_position += qty;
        st.next_id += 1;
        Ok(format!("perp-{}", st.next_id))
    }

    async fn get_futures_position(&self, _symbol: &str) -> VenueResult<f64> {
        Ok(self.state.lock().perp_position)
    }

    fn last_hedge_avg_price(&self) -> Option<f64> {
        self.state.lock().hedge_avg_price
    }

    async fn internal_transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> VenueResult<()> {
        self.state
            .lock()
            .transfers
            .push((asset.to_string(), amount, direction));
        Ok(())
    }

    async fn preflight_check(&self, _symbol_spot: &str, _symbol_perp: &str)
        -> VenueResult<PreflightInfo> {
        Ok(self.state.lock().preflight)
    }
}
