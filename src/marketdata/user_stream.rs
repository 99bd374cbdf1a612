//! Binance user-data stream: listenKey lifecycle plus executionReport
//! normalization into [`FillEvent`]s on a bounded channel.
//!
//! The reconciler drains the channel non-blockingly; if it ever falls far
//! enough behind that the channel fills, events are dropped here with a
//! warning and the periodic REST reconciliation covers the loss.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{FillEvent, FillStatus};

const SPOT_REST: &str = "https://api.binance.com";
const SPOT_REST_TESTNET: &str = "https://testnet.binance.vision";
const SPOT_WS: &str = "wss://stream.binance.com:9443/ws";
const SPOT_WS_TESTNET: &str = "wss://testnet.binance.vision/ws";

/// listenKeys expire after 60 minutes; refresh well before that.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(25 * 60);

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Capacity of the fill-event channel between the stream task and the
/// reconciler.
pub const FILL_CHANNEL_CAPACITY: usize = 1024;

pub struct UserStream {
    http: reqwest::Client,
    api_key: String,
    rest_base: &'static str,
    ws_base: &'static str,
}

impl UserStream {
    pub fn new(api_key: String, testnet: bool) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            api_key,
            rest_base: if testnet { SPOT_REST_TESTNET } else { SPOT_REST },
            ws_base: if testnet { SPOT_WS_TESTNET } else { SPOT_WS },
        }
    }

    async fn create_listen_key(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/api/v3/userDataStream", self.rest_base))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("listenKey create request failed")?
            .error_for_status()
            .context("listenKey create rejected")?;
        let body: Value = resp.json().await.context("listenKey create body")?;
        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .context("listenKey missing from response")?
            .to_string();
        info!("listenKey created");
        Ok(key)
    }

    async fn keepalive_listen_key(&self, listen_key: &str) {
        let result = self
            .http
            .put(format!("{}/api/v3/userDataStream", self.rest_base))
            .header("X-MBX-APIKEY", &self.api_key)
            .query(&[("listenKey", listen_key)])
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!("listenKey keepalive ok"),
            Err(e) => warn!(error = %e, "listenKey keepalive failed"),
        }
    }

    /// Runs the user-data stream until `shutdown` flips, pushing normalized
    /// buy-side fill events into `fills`.
    pub async fn run(
        self,
        fills: mpsc::Sender<FillEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut delay = RECONNECT_BASE;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let listen_key = match self.create_listen_key().await {
                Ok(k) => k,
                Err(e) => {
                    warn!(error = %e, "cannot start user-data stream");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX);
                    continue;
                }
            };

            let url = format!("{}/{}", self.ws_base, listen_key);
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    info!("user-data stream connected");
                    delay = RECONNECT_BASE;
                    let mut last_keepalive = Instant::now();

                    loop {
                        if last_keepalive.elapsed() > KEEPALIVE_EVERY {
                            self.keepalive_listen_key(&listen_key).await;
                            last_keepalive = Instant::now();
                        }

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
                                        if let Ok(v) = serde_json::from_str::<Value>(&text) {
                                            if let Some(event) = parse_execution_report(&v) {
                                                match fills.try_send(event) {
                                                    Ok(()) => {}
                                                    Err(mpsc::error::TrySendError::Full(ev)) => {
                                                        warn!(order_id = %ev.order_id,
                                                            "fill channel full, dropping event");
                                                    }
                                                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                                                }
                                            }
                                        }
                                    }
                                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                                    Some(Ok(Message::Close(_))) | None => {
                                        warn!("user-data stream closed by peer");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!(error = %e, "user-data stream read error");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "user-data stream connect failed"),
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_MAX);
        }
    }
}

/// Maps a spot `executionReport` to a [`FillEvent`].
///
/// Only buy-side TRADE executions become events — the open ladder is
/// buy-only, and the close task tracks its sells by polling. Everything
/// else (including unknown statuses) is dropped.
fn parse_execution_report(v: &Value) -> Option<FillEvent> {
    if v.get("e")?.as_str()? != "executionReport" {
        return None;
    }
    let exec_type = v.get("x")?.as_str()?;
    let side = v.get("S")?.as_str()?;
    if exec_type != "TRADE" || side != "BUY" {
        return None;
    }
    let status = FillStatus::from_wire(v.get("X")?.as_str()?)?;
    let order_id = match v.get("i")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };

    Some(FillEvent {
        order_id,
        cum_filled_base: parse_f64(v.get("z")?)?,
        last_fill_qty: parse_f64(v.get("l")?)?,
        last_fill_px: parse_f64(v.get("L")?)?,
        status,
    })
}

fn parse_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(exec_type: &str, side: &str, status: &str) -> Value {
        json!({
            "e": "executionReport",
            "s": "BTCUSDT",
            "i": 12345,
            "S": side,
            "x": exec_type,
            "X": status,
            "z": "0.00200000",
            "l": "0.00100000",
            "L": "100.00"
        })
    }

    #[test]
    fn buy_trade_becomes_event() {
        let ev = parse_execution_report(&report("TRADE", "BUY", "PARTIALLY_FILLED")).unwrap();
        assert_eq!(ev.order_id, "12345");
        assert!((ev.cum_filled_base - 0.002).abs() < 1e-12);
        assert!((ev.last_fill_qty - 0.001).abs() < 1e-12);
        assert!((ev.last_fill_px - 100.0).abs() < 1e-12);
        assert_eq!(ev.status, FillStatus::PartiallyFilled);
    }

    #[test]
    fn non_trade_and_sells_are_dropped() {
        assert!(parse_execution_report(&report("NEW", "BUY", "NEW")).is_none());
        assert!(parse_execution_report(&report("TRADE", "SELL", "FILLED")).is_none());
        assert!(parse_execution_report(&report("CANCELED", "BUY", "CANCELED")).is_none());
    }

    #[test]
    fn other_event_types_are_dropped() {
        let v = json!({"e": "outboundAccountPosition", "B": []});
        assert!(parse_execution_report(&v).is_none());
    }
}
