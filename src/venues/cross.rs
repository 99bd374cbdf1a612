//! Cross-venue composite gateway: spot leg on one exchange, perp leg on
//! another, behind the same [`VenueGateway`] contract. The engine core
//! cannot tell it apart from a single venue.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{PreflightInfo, TransferDirection, VenueError, VenueGateway, VenueResult};
use crate::models::BookLevel;

pub struct CrossVenueGateway {
    spot: Arc<dyn VenueGateway>,
    perp: Arc<dyn VenueGateway>,
}

impl CrossVenueGateway {
    pub fn new(spot: Arc<dyn VenueGateway>, perp: Arc<dyn VenueGateway>) -> Self {
        Self { spot, perp }
    }
}

#[async_trait]
impl VenueGateway for CrossVenueGateway {
    // ── perp leg ────────────────────────────────────────────────────────

    async fn get_futures_best_bid(&self, symbol: &str) -> VenueResult<f64> {
        self.perp.get_futures_best_bid(symbol).await
    }

    async fn get_futures_best_ask(&self, symbol: &str) -> VenueResult<f64> {
        self.perp.get_futures_best_ask(symbol).await
    }

    async fn place_futures_market_sell(&self, symbol: &str, qty: f64) -> VenueResult<String> {
        self.perp.place_futures_market_sell(symbol, qty).await
    }

    async fn place_futures_market_buy(&self, symbol: &str, qty: f64) -> VenueResult<String> {
        self.perp.place_futures_market_buy(symbol, qty).await
    }

    async fn get_futures_position(&self, symbol: &str) -> VenueResult<f64> {
        self.perp.get_futures_position(symbol).await
    }

    fn last_hedge_avg_price(&self) -> Option<f64> {
        self.perp.last_hedge_avg_price()
    }

    // ── spot leg (cancel / fill queries are always spot orders) ─────────

    async fn get_spot_depth(&self, symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>> {
        self.spot.get_spot_depth(symbol, levels).await
    }

    async fn get_spot_asks(&self, symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>> {
        self.spot.get_spot_asks(symbol, levels).await
    }

    async fn place_spot_limit_buy(&self, symbol: &str, price: f64, qty: f64)
        -> VenueResult<String> {
        self.spot.place_spot_limit_buy(symbol, price, qty).await
    }

    async fn place_spot_limit_sell(&self, symbol: &str, price: f64, qty: f64)
        -> VenueResult<String> {
        self.spot.place_spot_limit_sell(symbol, price, qty).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()> {
        self.spot.cancel_order(symbol, order_id).await
    }

    async fn get_order_filled_qty(&self, symbol: &str, order_id: &str) -> VenueResult<f64> {
        self.spot.get_order_filled_qty(symbol, order_id).await
    }

    // ── unsupported across venues ───────────────────────────────────────

    async fn internal_transfer(
        &self,
        _asset: &str,
        _amount: f64,
        _direction: TransferDirection,
    ) -> VenueResult<()> {
        Err(VenueError::Unsupported(
            "internal transfer is not available in cross-venue mode",
        ))
    }

    async fn preflight_check(&self, symbol_spot: &str, symbol_perp: &str)
        -> VenueResult<PreflightInfo> {
        let mut out = PreflightInfo::default();

        match self.spot.preflight_check(symbol_spot, symbol_spot).await {
            Ok(info) => {
                out.spot_tick_size = info.spot_tick_size;
                out.spot_lot_size = info.spot_lot_size;
            }
            Err(e) => warn!(error = %e, "spot-leg preflight failed, continuing"),
        }

        match self.perp.preflight_check(symbol_perp, symbol_perp).await {
            Ok(info) => {
                out.perp_tick_size = info.perp_tick_size;
                out.perp_lot_size = info.perp_lot_size;
            }
            Err(e) => warn!(error = %e, "perp-leg preflight failed, continuing"),
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::sim::SimVenue;

    #[tokio::test]
    async fn routes_legs_to_the_right_venue() {
        let spot = Arc::new(SimVenue::new());
        let perp = Arc::new(SimVenue::new());
        spot.set_spot_bids(vec![BookLevel::new(100.0, 5.0)]);
        perp.set_perp_top(100.4, 100.5);

        let cross = CrossVenueGateway::new(spot.clone(), perp.clone());

        let bids = cross.get_spot_depth("BTCUSDT", 5).await.unwrap();
        assert_eq!(bids.len(), 1);
        assert!((cross.get_futures_best_bid("BTCUSDT").await.unwrap() - 100.4).abs() < 1e-12);

        cross
            .place_futures_market_sell("BTCUSDT", 0.002)
            .await
            .unwrap();
        assert_eq!(perp.perp_sells().len(), 1);
        assert!(spot.perp_sells().is_empty());
    }

    #[tokio::test]
    async fn hedge_avg_price_forwards_from_perp_leg() {
        let spot = Arc::new(SimVenue::new());
        let perp = Arc::new(SimVenue::new());
        perp.set_hedge_avg_price(Some(100.45));
        let cross = CrossVenueGateway::new(spot, perp.clone());
        cross
            .place_futures_market_sell("BTCUSDT", 0.01)
            .await
            .unwrap();
        assert_eq!(cross.last_hedge_avg_price(), Some(100.45));
    }

    #[tokio::test]
    async fn internal_transfer_is_rejected() {
        let cross = CrossVenueGateway::new(Arc::new(SimVenue::new()), Arc::new(SimVenue::new()));
        let err = cross
            .internal_transfer("USDT", 100.0, TransferDirection::SpotToPerp)
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::Unsupported(_)));
    }
}
