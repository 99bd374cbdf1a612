//! Webhook notifier. Messages are fire-and-forget: each send runs in its
//! own task with a short timeout, and the engine never awaits one.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::models::StatusSnapshot;

pub struct Notifier {
    http: reqwest::Client,
    url: String,
    label: String,
}

impl Notifier {
    /// Returns `None` when no webhook is configured.
    pub fn new(webhook_url: &str, account_label: &str) -> Option<Arc<Self>> {
        if webhook_url.is_empty() {
            return None;
        }
        Some(Arc::new(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            url: webhook_url.to_string(),
            label: account_label.to_string(),
        }))
    }

    fn prefix(&self) -> String {
        if self.label.is_empty() {
            String::new()
        } else {
            format!("[{}] ", self.label)
        }
    }

    /// Spawns the actual send and returns immediately.
    pub fn send_text(self: &Arc<Self>, text: String) {
        let this = Arc::clone(self);
        let body = format!("{}{}", this.prefix(), text);
        tokio::spawn(async move {
            let payload = json!({"msg_type": "text", "content": {"text": body}});
            match this.http.post(&this.url).json(&payload).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), "webhook rejected notification");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "webhook send failed"),
            }
        });
    }

    // ── event helpers ───────────────────────────────────────────────────

    pub fn notify_start(self: &Arc<Self>, symbol: &str) {
        self.send_text(format!("[engine started] {symbol}"));
    }

    pub fn notify_open_start(self: &Arc<Self>, symbol: &str, budget: f64) {
        self.send_text(format!("[opening started] {symbol}\nbudget: {budget:.4} base"));
    }

    pub fn notify_close_start(self: &Arc<Self>, symbol: &str, target_qty: f64) {
        self.send_text(format!("[close started] {symbol}\ntarget: {target_qty:.4} base"));
    }

    pub fn notify_hedge(
        self: &Arc<Self>,
        symbol: &str,
        hedge_qty: f64,
        hedge_price: Option<f64>,
        total_filled: f64,
        total_budget: f64,
    ) {
        let px = match hedge_price {
            Some(p) if p > 0.0 => format!(" @ {p:.6}"),
            _ => String::new(),
        };
        self.send_text(format!(
            "[open fill hedged] {symbol}\nhedged: {hedge_qty:.4} base{px}\nprogress: {total_filled:.4} / {total_budget:.4} base"
        ));
    }

    pub fn notify_close_trade(
        self: &Arc<Self>,
        symbol: &str,
        sold_this: f64,
        total_sold: f64,
        total_perp_bought: f64,
        target_qty: f64,
    ) {
        self.send_text(format!(
            "[close fill] {symbol}\nsold: {sold_this:.4} base\ntotal sold: {total_sold:.4} / {target_qty:.4} base\nperp bought back: {total_perp_bought:.4} base"
        ));
    }

    pub fn notify_naked_exposure(self: &Arc<Self>, symbol: &str, naked: f64) {
        self.send_text(format!(
            "[NAKED EXPOSURE] {symbol}\nunhedged: {naked:.6} base — engine in protective mode"
        ));
    }

    /// Open-side finish summary.
    pub fn notify_finish_open(self: &Arc<Self>, snap: &StatusSnapshot) {
        let spot_avg = snap
            .spot_avg_price
            .map_or("-".to_string(), |p| format!("{p:.6}"));
        let perp_avg = snap
            .perp_avg_price
            .map_or("-".to_string(), |p| format!("{p:.6}"));
        let mut lines = vec![
            format!("[opening finished] {}", snap.symbol_spot),
            format!("spot bought: {:.4} base", snap.spot_filled_base),
            format!("perp sold: {:.4} base", snap.perp_hedged_base),
            format!("spot avg: {spot_avg}"),
            format!("perp avg: {perp_avg}"),
        ];
        if snap.naked_exposure > 1e-12 {
            lines.push(format!("naked exposure: {:.6} base", snap.naked_exposure));
        }
        self.send_text(lines.join("\n"));
    }

    /// Close-side finish summary.
    pub fn notify_finish_close(self: &Arc<Self>, close: &crate::models::CloseStatus) {
        let mut lines = vec![
            format!("[close finished] {}", close.symbol),
            format!("spot sold: {:.4} base", close.spot_sold),
            format!("perp bought: {:.4} base", close.perp_bought),
        ];
        if close.spot_sold > 1e-12 {
            lines.push(format!(
                "spot avg: {:.6}",
                close.spot_sold_quote / close.spot_sold
            ));
        }
        if close.perp_bought > 1e-12 {
            lines.push(format!(
                "perp avg: {:.6}",
                close.perp_bought_quote / close.perp_bought
            ));
        }
        if close.pending_hedge > 1e-12 {
            lines.push(format!("pending hedge: {:.6} base", close.pending_hedge));
        }
        self.send_text(lines.join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_disables_notifier() {
        assert!(Notifier::new("", "acct").is_none());
        assert!(Notifier::new("http://localhost:1/hook", "acct").is_some());
    }

    #[test]
    fn prefix_wraps_label() {
        let n = Notifier::new("http://localhost:1/hook", "main").unwrap();
        assert_eq!(n.prefix(), "[main] ");
        let n = Notifier::new("http://localhost:1/hook", "").unwrap();
        assert_eq!(n.prefix(), "");
    }
}
