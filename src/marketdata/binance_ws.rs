//! Binance market-data websocket consumers.
//!
//! Two independent tasks feed the [`MarketCache`]: the spot `depth5@100ms`
//! partial-book stream and the perp `bookTicker` stream. Each reconnects
//! with exponential backoff capped at 30s and resets the backoff after a
//! successful connect.

use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::MarketCache;
use crate::models::BookLevel;

const SPOT_DEPTH_WS: &str = "wss://stream.binance.com:9443/ws";
const SPOT_DEPTH_WS_TESTNET: &str = "wss://testnet.binance.vision/ws";
const PERP_BOOK_WS: &str = "wss://fstream.binance.com/ws";
const PERP_BOOK_WS_TESTNET: &str = "wss://stream.binancefuture.com/ws";

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub fn spot_depth_url(symbol: &str, testnet: bool) -> String {
    let base = if testnet { SPOT_DEPTH_WS_TESTNET } else { SPOT_DEPTH_WS };
    format!("{}/{}@depth5@100ms", base, symbol.to_lowercase())
}

pub fn perp_book_url(symbol: &str, testnet: bool) -> String {
    let base = if testnet { PERP_BOOK_WS_TESTNET } else { PERP_BOOK_WS };
    format!("{}/{}@bookTicker", base, symbol.to_lowercase())
}

/// Runs the spot depth stream until `shutdown` flips.
pub async fn run_spot_depth_stream(
    url: String,
    cache: Arc<MarketCache>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    run_stream(url, shutdown, move |msg| {
        if let Some((bids, asks)) = parse_depth5(&msg) {
            cache.update_spot_depth(bids, asks);
        } else {
            warn!("malformed spot depth payload");
        }
    })
    .await;
}

/// Runs the perp bookTicker stream until `shutdown` flips.
pub async fn run_perp_book_stream(
    url: String,
    cache: Arc<MarketCache>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    run_stream(url, shutdown, move |msg| {
        if let Some((bid, ask)) = parse_book_ticker(&msg) {
            cache.update_perp(bid, ask);
        } else {
            warn!("malformed perp bookTicker payload");
        }
    })
    .await;
}

async fn run_stream<F>(url: String, mut shutdown: tokio::sync::watch::Receiver<bool>, mut on_msg: F)
where
    F: FnMut(Value),
{
    let mut delay = RECONNECT_BASE;

    loop {
        if *shutdown.borrow() {
            break;
        }

        info!(%url, "connecting market-data stream");
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                delay = RECONNECT_BASE;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        frame = ws.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<Value>(&text) {
                                        Ok(v) => on_msg(v),
                                        Err(e) => debug!(error = %e, "non-JSON frame"),
                                    }
                                }
                                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!(%url, "stream closed by peer");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(%url, error = %e, "stream read error");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "stream connect failed");
            }
        }

        if *shutdown.borrow() {
            break;
        }
        warn!(%url, delay_secs = delay.as_secs_f64(), "reconnecting after backoff");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX);
    }
}

/// `{"bids":[["price","qty"],...],"asks":[["price","qty"],...]}`
fn parse_depth5(v: &Value) -> Option<(Vec<BookLevel>, Vec<BookLevel>)> {
    let bids = parse_levels(v.get("bids")?)?;
    let asks = parse_levels(v.get("asks")?)?;
    Some((bids, asks))
}

fn parse_levels(v: &Value) -> Option<Vec<BookLevel>> {
    let arr = v.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let pair = entry.as_array()?;
        let price: f64 = pair.first()?.as_str()?.parse().ok()?;
        let size: f64 = pair.get(1)?.as_str()?.parse().ok()?;
        out.push(BookLevel::new(price, size));
    }
    Some(out)
}

/// `{"b":"<bid>","a":"<ask>", ...}`
fn parse_book_ticker(v: &Value) -> Option<(f64, f64)> {
    let bid: f64 = v.get("b")?.as_str()?.parse().ok()?;
    let ask: f64 = v.get("a")?.as_str()?.parse().ok()?;
    Some((bid, ask))
}
