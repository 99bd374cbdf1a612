//! Operator control channel: a Unix-domain stream socket speaking
//! line-delimited JSON `{cmd, args}` requests. Every response carries
//! `ok` and `msg`. Bare text commands (`status`, `budget 8000`) are
//! accepted as a fallback for hand-driven socat sessions.

use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::config::StrategyConfig;
use crate::engine::closer::{CloseHandle, CloseTask};
use crate::engine::state::EngineState;
use crate::journal::TradeJournal;
use crate::notify::Notifier;
use crate::venues::{TransferDirection, VenueGateway};

/// Everything a control command can touch.
pub struct ControlContext {
    pub state: Arc<EngineState>,
    pub close: Arc<CloseHandle>,
    pub venue: Arc<dyn VenueGateway>,
    pub journal: Option<Arc<TradeJournal>>,
    pub notifier: Option<Arc<Notifier>>,
    pub cfg: StrategyConfig,
}

#[derive(Debug, Deserialize)]
struct Request {
    cmd: String,
    #[serde(default)]
    args: Vec<Value>,
}

fn arg_str(args: &[Value], i: usize) -> Option<String> {
    match args.get(i)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn arg_f64(args: &[Value], i: usize) -> Option<f64> {
    match args.get(i)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn err(msg: impl Into<String>) -> Value {
    json!({"ok": false, "msg": msg.into()})
}

fn ok(msg: impl Into<String>) -> Value {
    json!({"ok": true, "msg": msg.into()})
}

impl ControlContext {
    async fn status_response(&self) -> Value {
        let bids = self
            .venue
            .get_spot_depth(&self.cfg.symbol_spot, 5)
            .await
            .unwrap_or_default();
        let snap = self.state.status_snapshot(
            &self.cfg.symbol_spot,
            &self.cfg.symbol_perp,
            &bids,
            self.close.snapshot(),
        );
        let mut v = serde_json::to_value(&snap).unwrap_or_else(|_| json!({}));
        v["ok"] = json!(true);
        v["msg"] = json!("");
        v
    }

    fn spread_response(&self, msg: Option<String>) -> Value {
        let mut v = json!({
            "ok": true,
            "min_profit_bps": self.cfg_fee_min_profit(),
            "net_cost_bps": self.state.fee().net_cost() * 10_000.0,
            "min_spread_bps": self.state.min_spread_bps(),
            "spread_mode": self.state.spread_mode(),
        });
        if let Some(msg) = msg {
            v["msg"] = json!(msg);
        }
        v
    }

    fn cfg_fee_min_profit(&self) -> f64 {
        self.state.fee().min_profit_bps
    }

    fn start_close(&self, symbol: String, qty: f64) -> (bool, String) {
        if qty <= 0.0 {
            return (false, "close quantity must be > 0".to_string());
        }
        if self.close.is_active() {
            return (false, "a close task is already running".to_string());
        }
        // Precondition: the open side stops quoting; the paused coordinator
        // clears the ladder and the close task waits for that.
        self.state.pause();
        if !self.close.try_begin(&symbol, qty) {
            return (false, "a close task is already running".to_string());
        }
        let task = CloseTask::new(
            self.venue.clone(),
            self.state.clone(),
            self.close.clone(),
            self.journal.clone(),
            self.notifier.clone(),
            self.cfg.clone(),
            symbol.clone(),
            qty,
        );
        tokio::spawn(task.run());
        (true, format!("close task started: {symbol} qty={qty:.6}"))
    }

    async fn dispatch(&self, cmd: &str, args: &[Value]) -> Value {
        match cmd {
            "status" => self.status_response().await,

            "start" => {
                let budget = match args.first() {
                    Some(_) => match arg_f64(args, 0) {
                        Some(b) if b > 0.0 => Some(b),
                        Some(_) => return err("budget must be > 0"),
                        None => return err("invalid number"),
                    },
                    None => None,
                };
                if let Some(b) = budget {
                    self.state.set_budget(b);
                }
                let was_paused = self.state.is_paused();
                if was_paused {
                    self.state.resume();
                    if let Some(notifier) = &self.notifier {
                        notifier.notify_open_start(&self.cfg.symbol_spot, self.state.budget());
                    }
                }
                match (budget, was_paused) {
                    (Some(b), true) => ok(format!("budget set to {b:.6} base, quoting resumed")),
                    (Some(b), false) => ok(format!("budget set to {b:.6} base, already running")),
                    (None, true) => ok("quoting resumed"),
                    (None, false) => ok("already running"),
                }
            }

            "pause" => {
                if self.state.is_paused() {
                    ok("already paused")
                } else {
                    self.state.pause();
                    ok("paused, all quotes will be cancelled")
                }
            }

            "stop" => {
                self.state.stop();
                ok("stopping...")
            }

            "pause_close" => {
                if !self.close.is_active() {
                    err("no close task running")
                } else {
                    self.close.set_paused(true);
                    ok("close task paused")
                }
            }

            "resume_close" => {
                if !self.close.is_active() {
                    err("no close task running")
                } else {
                    self.close.set_paused(false);
                    ok("close task resumed")
                }
            }

            "close" => {
                let (symbol, qty_arg) = match args.len() {
                    0 => return err("usage: close [symbol] qty"),
                    1 => (self.cfg.symbol_spot.clone(), arg_f64(args, 0)),
                    _ => {
                        let mut sym = match arg_str(args, 0) {
                            Some(s) => s.to_uppercase(),
                            None => return err("invalid symbol"),
                        };
                        if !sym.ends_with("USDT") {
                            sym.push_str("USDT");
                        }
                        (sym, arg_f64(args, 1))
                    }
                };
                let Some(qty) = qty_arg else {
                    return err("invalid quantity");
                };
                let (started, msg) = self.start_close(symbol, qty);
                json!({"ok": started, "msg": msg})
            }

            "finish_open" => {
                self.state.pause();
                let bids = self
                    .venue
                    .get_spot_depth(&self.cfg.symbol_spot, 5)
                    .await
                    .unwrap_or_default();
                let snap = self.state.status_snapshot(
                    &self.cfg.symbol_spot,
                    &self.cfg.symbol_perp,
                    &bids,
                    self.close.snapshot(),
                );
                if let Some(notifier) = &self.notifier {
                    notifier.notify_finish_open(&snap);
                }
                ok(format!(
                    "opening finished: filled {:.6}, hedged {:.6}, naked {:.6}",
                    snap.spot_filled_base, snap.perp_hedged_base, snap.naked_exposure
                ))
            }

            "finish_close" => {
                if !self.close.is_active() {
                    err("no close task running")
                } else {
                    self.close.request_finish();
                    ok("close task finishing")
                }
            }

            "budget" => match args.first() {
                None => {
                    let inner_budget = self.state.budget();
                    let used = self.state.ledger().total_filled_base;
                    json!({
                        "ok": true,
                        "budget": inner_budget,
                        "used": used,
                        "remaining": (inner_budget - used).max(0.0),
                    })
                }
                Some(_) => match arg_f64(args, 0) {
                    Some(b) if b > 0.0 => {
                        self.state.set_budget(b);
                        ok(format!("total budget set to {b:.6} base"))
                    }
                    Some(_) => err("budget must be > 0"),
                    None => err("invalid number"),
                },
            },

            "spread" => match args.first() {
                None => self.spread_response(None),
                Some(_) => {
                    let raw = arg_str(args, 0).unwrap_or_default();
                    if raw.eq_ignore_ascii_case("auto") {
                        self.state.clear_manual_min_spread_bps();
                        self.spread_response(Some("min spread switched to auto".to_string()))
                    } else {
                        match raw.parse::<f64>() {
                            Ok(bps) => {
                                self.state.set_manual_min_spread_bps(bps);
                                self.spread_response(Some(format!(
                                    "min spread pinned at {bps:.4} bps"
                                )))
                            }
                            Err(_) => err("invalid number"),
                        }
                    }
                }
            },

            "spread_info" => self.spread_response(None),

            "transfer" => {
                let Some(asset) = arg_str(args, 0) else {
                    return err("usage: transfer asset amount direction");
                };
                let Some(amount) = arg_f64(args, 1) else {
                    return err("invalid amount");
                };
                if amount <= 0.0 {
                    return err("amount must be > 0");
                }
                let Some(direction) =
                    arg_str(args, 2).as_deref().and_then(TransferDirection::parse)
                else {
                    return err("direction must be spot_to_perp or perp_to_spot");
                };
                match self
                    .venue
                    .internal_transfer(&asset.to_uppercase(), amount, direction)
                    .await
                {
                    Ok(()) => ok(format!("transferred {amount} {asset} ({direction:?})")),
                    Err(e) => err(format!("transfer failed: {e}")),
                }
            }

            other => err(format!("unknown command: {other}")),
        }
    }
}

pub struct ControlServer {
    socket_path: PathBuf,
    ctx: Arc<ControlContext>,
}

impl ControlServer {
    pub fn new(socket_path: &Path, ctx: ControlContext) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            ctx: Arc::new(ctx),
        }
    }

    /// Binds the socket and serves until `shutdown` flips.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        // Stale socket file from an unclean exit.
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(l) => l,
            Err(e) => {
                warn!(path = %self.socket_path.display(), error = %e, "control socket bind failed");
                return;
            }
        };
        // Operator tooling may run as another user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(0o777),
            );
        }
        info!(path = %self.socket_path.display(), "control server listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    warn!(error = %e, "control connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "control accept failed"),
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("control server stopped");
    }
}

async fn handle_connection(stream: UnixStream, ctx: Arc<ControlContext>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            // bare-text fallback: "budget 8000"
            Err(_) => {
                let mut parts = line.split_whitespace();
                let cmd = parts.next().unwrap_or_default().to_string();
                let args = parts.map(|p| Value::String(p.to_string())).collect();
                Request { cmd, args }
            }
        };

        let response = ctx
            .dispatch(&request.cmd.to_lowercase(), &request.args)
            .await;
        let mut payload = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::venues::sim::SimVenue;

    fn ctx() -> ControlContext {
        let cfg = StrategyConfig {
            total_budget_base: 1.0,
            poll_interval_secs: 0.01,
            ..StrategyConfig::default()
        };
        ControlContext {
            state: Arc::new(EngineState::new(1.0, FeeConfig::default())),
            close: CloseHandle::new(),
            venue: Arc::new(SimVenue::new()),
            journal: None,
            notifier: None,
            cfg,
        }
    }

    #[tokio::test]
    async fn status_always_carries_ok_and_msg() {
        let ctx = ctx();
        let resp = ctx.dispatch("status", &[]).await;
        assert_eq!(resp["ok"], json!(true));
        assert!(resp.get("msg").is_some());
        assert_eq!(resp["paused"], json!(true));
        assert_eq!(resp["budget"], json!(1.0));
    }

    #[tokio::test]
    async fn start_resumes_and_sets_budget() {
        let ctx = ctx();
        assert!(ctx.state.is_paused());
        let resp = ctx.dispatch("start", &[json!("2.5")]).await;
        assert_eq!(resp["ok"], json!(true));
        assert!(!ctx.state.is_paused());
        assert!((ctx.state.budget() - 2.5).abs() < 1e-12);

        let resp = ctx.dispatch("start", &[]).await;
        assert_eq!(resp["msg"], json!("already running"));
    }

    #[tokio::test]
    async fn budget_query_and_update() {
        let ctx = ctx();
        let resp = ctx.dispatch("budget", &[]).await;
        assert_eq!(resp["budget"], json!(1.0));
        assert_eq!(resp["remaining"], json!(1.0));

        let resp = ctx.dispatch("budget", &[json!(-1.0)]).await;
        assert_eq!(resp["ok"], json!(false));

        let resp = ctx.dispatch("budget", &[json!("0.75")]).await;
        assert_eq!(resp["ok"], json!(true));
        assert!((ctx.state.budget() - 0.75).abs() < 1e-12);
    }

    #[tokio::test]
    async fn spread_manual_and_auto_modes() {
        let ctx = ctx();
        let resp = ctx.dispatch("spread", &[json!("1.5")]).await;
        assert_eq!(resp["ok"], json!(true));
        assert_eq!(resp["spread_mode"], json!("manual"));
        assert!((ctx.state.min_spread_bps() - 1.5).abs() < 1e-9);

        let resp = ctx.dispatch("spread", &[json!("auto")]).await;
        assert_eq!(resp["spread_mode"], json!("auto"));

        let resp = ctx.dispatch("spread_info", &[]).await;
        assert_eq!(resp["ok"], json!(true));
        assert!((resp["net_cost_bps"].as_f64().unwrap() - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pause_and_stop_flip_engine_flags() {
        let ctx = ctx();
        ctx.state.resume();
        let resp = ctx.dispatch("pause", &[]).await;
        assert_eq!(resp["ok"], json!(true));
        assert!(ctx.state.is_paused());

        ctx.dispatch("stop", &[]).await;
        assert!(!ctx.state.is_running());
    }

    #[tokio::test]
    async fn close_command_pauses_and_starts_task() {
        let ctx = ctx();
        ctx.state.resume();
        let resp = ctx.dispatch("close", &[json!("0.5")]).await;
        assert_eq!(resp["ok"], json!(true));
        assert!(ctx.state.is_paused());
        assert!(ctx.close.is_active());

        // second close refused while the first runs
        let resp = ctx.dispatch("close", &[json!("0.1")]).await;
        assert_eq!(resp["ok"], json!(false));

        ctx.close.request_finish();
    }

    #[tokio::test]
    async fn close_command_validates_args() {
        let ctx = ctx();
        assert_eq!(ctx.dispatch("close", &[]).await["ok"], json!(false));
        assert_eq!(
            ctx.dispatch("close", &[json!("abc")]).await["ok"],
            json!(false)
        );
        assert_eq!(
            ctx.dispatch("close", &[json!("-0.5")]).await["ok"],
            json!(false)
        );
    }

    #[tokio::test]
    async fn close_task_commands_require_active_task() {
        let ctx = ctx();
        assert_eq!(ctx.dispatch("pause_close", &[]).await["ok"], json!(false));
        assert_eq!(ctx.dispatch("resume_close", &[]).await["ok"], json!(false));
        assert_eq!(ctx.dispatch("finish_close", &[]).await["ok"], json!(false));
    }

    #[tokio::test]
    async fn transfer_routes_to_venue() {
        let ctx = ctx();
        let venue = Arc::new(SimVenue::new());
        let ctx = ControlContext {
            venue: venue.clone(),
            ..ctx
        };
        let resp = ctx
            .dispatch(
                "transfer",
                &[json!("usdt"), json!("100.0"), json!("spot_to_perp")],
            )
            .await;
        assert_eq!(resp["ok"], json!(true));
        let transfers = venue.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, "USDT");
        assert_eq!(transfers[0].2, TransferDirection::SpotToPerp);

        let resp = ctx
            .dispatch("transfer", &[json!("usdt"), json!("1"), json!("sideways")])
            .await;
        assert_eq!(resp["ok"], json!(false));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let ctx = ctx();
        let resp = ctx.dispatch("frobnicate", &[]).await;
        assert_eq!(resp["ok"], json!(false));
    }

    #[tokio::test]
    async fn socket_round_trip_with_text_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ctl.sock");
        let server = ControlServer::new(&sock, ctx());
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server_task = tokio::spawn(server.run(shutdown_rx));

        // wait for bind
        let mut stream = loop {
            match UnixStream::connect(&sock).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };

        stream
            .write_all(b"{\"cmd\":\"budget\",\"args\":[\"3.0\"]}\n")
            .await
            .unwrap();
        stream.write_all(b"status\n").await.unwrap();

        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let first: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["ok"], json!(true));
        let second: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["budget"], json!(3.0));

        shutdown_tx.send(true).unwrap();
        server_task.abort();
    }
}
