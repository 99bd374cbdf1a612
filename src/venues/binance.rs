//! Binance gateway: spot REST on `api.binance.com`, USD-M perp REST on
//! `fapi.binance.com`, HMAC-SHA256 signed, sliding-window weight limited.
//!
//! Market-data reads prefer the websocket cache and fall back to REST when
//! the cache is stale. Venue error codes are mapped onto the
//! [`VenueError`] taxonomy so the engine never string-matches.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rate_limit::WeightLimiter;
use super::{
    PreflightInfo, TransferDirection, VenueError, VenueGateway, VenueResult, FILLED_QTY_UNKNOWN,
};
use crate::marketdata::MarketCache;
use crate::models::BookLevel;

type HmacSha256 = Hmac<Sha256>;

const SPOT_BASE: &str = "https://api.binance.com";
const SPOT_BASE_TESTNET: &str = "https://testnet.binance.vision";
const PERP_BASE: &str = "https://fapi.binance.com";
const PERP_BASE_TESTNET: &str = "https://testnet.binancefuture.com";

// Binance API error codes
const ERR_UNKNOWN_ORDER: i64 = -2011; // cancel target already gone
const ERR_ORDER_NOT_FOUND: i64 = -2013; // query target purged
const ERR_MIN_NOTIONAL: i64 = -4164; // perp notional floor

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Formats a quantity/price without scientific notation or trailing noise.
pub fn fmt_decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

pub struct BinanceGateway {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    spot_base: &'static str,
    perp_base: &'static str,
    cache: Option<Arc<MarketCache>>,
    spot_limiter: WeightLimiter,
    perp_limiter: WeightLimiter,
    last_hedge_px: Mutex<Option<f64>>,
}

impl BinanceGateway {
    pub fn new(
        api_key: String,
        api_secret: String,
        testnet: bool,
        cache: Option<Arc<MarketCache>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key,
            api_secret,
            spot_base: if testnet { SPOT_BASE_TESTNET } else { SPOT_BASE },
            perp_base: if testnet { PERP_BASE_TESTNET } else { PERP_BASE },
            cache,
            spot_limiter: WeightLimiter::new(1200, Duration::from_secs(60)),
            perp_limiter: WeightLimiter::new(2400, Duration::from_secs(60)),
            last_hedge_px: Mutex::new(None),
        }
    }

    // ── request plumbing ────────────────────────────────────────────────

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("hmac accepts any key");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={ts}"));
        let sig = self.sign(&query);
        format!("{query}&signature={sig}")
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> VenueResult<Value> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                VenueError::Timeout
            } else {
                VenueError::Transient(e.to_string())
            }
        })?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Transient(format!("bad response body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        Err(classify_api_error(status.as_u16(), code, msg))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        base: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> VenueResult<Value> {
        let query = self.signed_query(params);
        let url = format!("{base}{path}?{query}");
        let req = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key);
        self.send(req).await
    }

    async fn public_get(
        &self,
        base: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> VenueResult<Value> {
        let req = self.http.get(format!("{base}{path}")).query(params);
        self.send(req).await
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn parse_order_id(body: &Value) -> VenueResult<String> {
        match body.get("orderId") {
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(VenueError::Transient("orderId missing from response".into())),
        }
    }

    fn parse_levels(body: &Value, side: &str) -> VenueResult<Vec<BookLevel>> {
        let arr = body
            .get(side)
            .and_then(Value::as_array)
            .ok_or_else(|| VenueError::Transient(format!("{side} missing from depth")))?;
        let mut out = Vec::with_capacity(arr.len());
        for entry in arr {
            let pair = entry
                .as_array()
                .ok_or_else(|| VenueError::Transient("bad depth level".into()))?;
            let price = str_f64(pair.first())
                .ok_or_else(|| VenueError::Transient("bad depth price".into()))?;
            let size = str_f64(pair.get(1))
                .ok_or_else(|| VenueError::Transient("bad depth size".into()))?;
            out.push(BookLevel::new(price, size));
        }
        Ok(out)
    }

    /// Re-queries the perp order when the placement response carried
    /// `avgPrice = 0` (market orders frequently do).
    async fn resolve_perp_avg_price(&self, symbol: &str, order_id: &str) -> Option<f64> {
        for attempt in 1..=3u32 {
            let params = [
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ];
            match self
                .signed_request(reqwest::Method::GET, self.perp_base, "/fapi/v1/order", &params)
                .await
            {
                Ok(body) => {
                    let avg = str_or_num_f64(body.get("avgPrice")).unwrap_or(0.0);
                    if avg > 0.0 {
                        return Some(avg);
                    }
                    let executed = str_or_num_f64(body.get("executedQty")).unwrap_or(0.0);
                    let cum_quote = str_or_num_f64(body.get("cumQuote")).unwrap_or(0.0);
                    if executed > 0.0 && cum_quote > 0.0 {
                        return Some(cum_quote / executed);
                    }
                }
                Err(e) => {
                    debug!(order_id, attempt, error = %e, "perp avg-price re-query failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
        }
        None
    }

    async fn place_perp_market(&self, symbol: &str, side: &str, qty: f64) -> VenueResult<String> {
        self.perp_limiter.acquire(1).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", fmt_decimal(qty)),
        ];
        let body = self
            .signed_request(reqwest::Method::POST, self.perp_base, "/fapi/v1/order", &params)
            .await?;
        let order_id = Self::parse_order_id(&body)?;

        let mut avg = str_or_num_f64(body.get("avgPrice")).filter(|&p| p > 0.0);
        if avg.is_none() {
            avg = self.resolve_perp_avg_price(symbol, &order_id).await;
        }
        info!(order_id, side, qty, avg_price = ?avg, "perp market order placed");
        *self.last_hedge_px.lock() = avg;
        Ok(order_id)
    }

    fn extract_filters(symbol_info: &Value) -> (Option<f64>, Option<f64>) {
        let mut tick = None;
        let mut lot = None;
        if let Some(filters) = symbol_info.get("filters").and_then(Value::as_array) {
            for f in filters {
                match f.get("filterType").and_then(Value::as_str) {
                    Some("PRICE_FILTER") => tick = str_or_num_f64(f.get("tickSize")),
                    Some("LOT_SIZE") => lot = str_or_num_f64(f.get("stepSize")),
                    _ => {}
                }
            }
        }
        (tick, lot)
    }

    fn find_symbol<'a>(info: &'a Value, symbol: &str) -> Option<&'a Value> {
        info.get("symbols")?
            .as_array()?
            .iter()
            .find(|s| s.get("symbol").and_then(Value::as_str) == Some(symbol))
    }
}

fn classify_api_error(http_status: u16, code: i64, msg: String) -> VenueError {
    match code {
        ERR_UNKNOWN_ORDER => VenueError::UnknownOrder(msg),
        ERR_ORDER_NOT_FOUND => VenueError::OrderNotFound(msg),
        ERR_MIN_NOTIONAL => VenueError::NotionalTooSmall,
        _ if msg.to_ascii_lowercase().contains("notional") => VenueError::NotionalTooSmall,
        _ if http_status >= 500 => VenueError::Transient(format!("{http_status} {code} {msg}")),
        _ => VenueError::Rejected(format!("{http_status} {code} {msg}")),
    }
}

fn str_f64(v: Option<&Value>) -> Option<f64> {
    v?.as_str()?.parse().ok()
}

fn str_or_num_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl VenueGateway for BinanceGateway {
    async fn get_futures_best_bid(&self, symbol: &str) -> VenueResult<f64> {
        if let Some(cache) = &self.cache {
            if let Some(bid) = cache.perp_bid() {
                return Ok(bid);
            }
            debug!("perp cache stale, falling back to REST");
        }
        self.perp_limiter.acquire(2).await;
        let params = [("symbol", symbol.to_string())];
        let body = self
            .public_get(self.perp_base, "/fapi/v1/ticker/bookTicker", &params)
            .await?;
        str_or_num_f64(body.get("bidPrice"))
            .ok_or_else(|| VenueError::Transient("bidPrice missing".into()))
    }

    async fn get_futures_best_ask(&self, symbol: &str) -> VenueResult<f64> {
        if let Some(cache) = &self.cache {
            if let Some(ask) = cache.perp_ask() {
                return Ok(ask);
            }
            debug!("perp cache stale, falling back to REST");
        }
        self.perp_limiter.acquire(2).await;
        let params = [("symbol", symbol.to_string())];
        let body = self
            .public_get(self.perp_base, "/fapi/v1/ticker/bookTicker", &params)
            .await?;
        str_or_num_f64(body.get("askPrice"))
            .ok_or_else(|| VenueError::Transient("askPrice missing".into()))
    }

    async fn get_spot_depth(&self, symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>> {
        if let Some(cache) = &self.cache {
            let bids = cache.spot_bids(levels);
            if !bids.is_empty() {
                return Ok(bids);
            }
            debug!("spot depth cache stale, falling back to REST");
        }
        self.spot_limiter.acquire(5).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("limit", levels.to_string()),
        ];
        let body = self.public_get(self.spot_base, "/api/v3/depth", &params).await?;
        Self::parse_levels(&body, "bids")
    }

    async fn get_spot_asks(&self, symbol: &str, levels: usize) -> VenueResult<Vec<BookLevel>> {
        if let Some(cache) = &self.cache {
            let asks = cache.spot_asks(levels);
            if !asks.is_empty() {
                return Ok(asks);
            }
            debug!("spot ask cache stale, falling back to REST");
        }
        self.spot_limiter.acquire(5).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("limit", levels.to_string()),
        ];
        let body = self.public_get(self.spot_base, "/api/v3/depth", &params).await?;
        Self::parse_levels(&body, "asks")
    }

    async fn place_spot_limit_buy(&self, symbol: &str, price: f64, qty: f64)
        -> VenueResult<String> {
        self.spot_limiter.acquire(1).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", fmt_decimal(qty)),
            ("price", fmt_decimal(price)),
        ];
        let body = self
            .signed_request(reqwest::Method::POST, self.spot_base, "/api/v3/order", &params)
            .await?;
        let order_id = Self::parse_order_id(&body)?;
        info!(order_id, price, qty, "spot limit buy placed");
        Ok(order_id)
    }

    async fn place_spot_limit_sell(&self, symbol: &str, price: f64, qty: f64)
        -> VenueResult<String> {
        self.spot_limiter.acquire(1).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("side", "SELL".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", fmt_decimal(qty)),
            ("price", fmt_decimal(price)),
        ];
        let body = self
            .signed_request(reqwest::Method::POST, self.spot_base, "/api/v3/order", &params)
            .await?;
        let order_id = Self::parse_order_id(&body)?;
        info!(order_id, price, qty, "spot limit sell placed");
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()> {
        self.spot_limiter.acquire(1).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        match self
            .signed_request(reqwest::Method::DELETE, self.spot_base, "/api/v3/order", &params)
            .await
        {
            Ok(_) => {
                info!(order_id, "order cancelled");
                Ok(())
            }
            // Race: filled or already cancelled between our decision and the
            // venue processing it. Idempotent success.
            Err(VenueError::UnknownOrder(_)) => {
                warn!(order_id, "cancel target already gone (likely filled)");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_filled_qty(&self, symbol: &str, order_id: &str) -> VenueResult<f64> {
        self.spot_limiter.acquire(2).await;
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        match self
            .signed_request(reqwest::Method::GET, self.spot_base, "/api/v3/order", &params)
            .await
        {
            Ok(body) => str_or_num_f64(body.get("executedQty"))
                .ok_or_else(|| VenueError::Transient("executedQty missing".into())),
            Err(VenueError::OrderNotFound(_)) => {
                warn!(order_id, "order purged venue-side, returning sentinel");
                Ok(FILLED_QTY_UNKNOWN)
            }
            Err(e) => Err(e),
        }
    }

    async fn place_futures_market_sell(&self, symbol: &str, qty: f64) -> VenueResult<String> {
        self.place_perp_market(symbol, "SELL", qty).await
    }

    async fn place_futures_market_buy(&self, symbol: &str, qty: f64) -> VenueResult<String> {
        self.place_perp_market(symbol, "BUY", qty).await
    }

    async fn get_futures_position(&self, symbol: &str) -> VenueResult<f64> {
        self.perp_limiter.acquire(5).await;
        let params = [("symbol", symbol.to_string())];
        let body = self
            .signed_request(
                reqwest::Method::GET,
                self.perp_base,
                "/fapi/v2/positionRisk",
                &params,
            )
            .await?;
        let amt = match &body {
            Value::Array(rows) => rows
                .iter()
                .find(|r| r.get("symbol").and_then(Value::as_str) == Some(symbol))
                .and_then(|r| str_or_num_f64(r.get("positionAmt"))),
            _ => str_or_num_f64(body.get("positionAmt")),
        };
        Ok(amt.unwrap_or(0.0))
    }

    fn last_hedge_avg_price(&self) -> Option<f64> {
        *self.last_hedge_px.lock()
    }

    async fn internal_transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> VenueResult<()> {
        self.spot_limiter.acquire(1).await;
        let transfer_type = match direction {
            TransferDirection::SpotToPerp => "1",
            TransferDirection::PerpToSpot => "2",
        };
        let params = [
            ("asset", asset.to_string()),
            ("amount", fmt_decimal(amount)),
            ("type", transfer_type.to_string()),
        ];
        self.signed_request(
            reqwest::Method::POST,
            self.spot_base,
            "/sapi/v1/futures/transfer",
            &params,
        )
        .await?;
        info!(asset, amount, ?direction, "internal transfer done");
        Ok(())
    }

    async fn preflight_check(&self, symbol_spot: &str, symbol_perp: &str)
        -> VenueResult<PreflightInfo> {
        let mut out = PreflightInfo::default();

        self.spot_limiter.acquire(10).await;
        let params = [("symbol", symbol_spot.to_string())];
        match self
            .public_get(self.spot_base, "/api/v3/exchangeInfo", &params)
            .await
        {
            Ok(info) => match Self::find_symbol(&info, symbol_spot) {
                Some(sym) => {
                    let (tick, lot) = Self::extract_filters(sym);
                    out.spot_tick_size = tick;
                    out.spot_lot_size = lot;
                    info!(symbol = symbol_spot, ?tick, ?lot, "spot preflight ok");
                }
                None => warn!(symbol = symbol_spot, "symbol missing from spot exchangeInfo"),
            },
            Err(e) => warn!(error = %e, "spot exchangeInfo failed"),
        }

        self.perp_limiter.acquire(1).await;
        match self
            .public_get(self.perp_base, "/fapi/v1/exchangeInfo", &[])
            .await
        {
            Ok(info) => match Self::find_symbol(&info, symbol_perp) {
                Some(sym) => {
                    let (tick, lot) = Self::extract_filters(sym);
                    out.perp_tick_size = tick;
                    out.perp_lot_size = lot;
                    info!(symbol = symbol_perp, ?tick, ?lot, "perp preflight ok");
                }
                None => warn!(symbol = symbol_perp, "symbol missing from perp exchangeInfo"),
            },
            Err(e) => warn!(error = %e, "perp exchangeInfo failed"),
        }

        Ok(out)
    }
}
