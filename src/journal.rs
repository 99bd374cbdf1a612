//! SQLite trade journal: one append-only `trades` table recording every
//! placement, fill and hedge, tagged with the account label.
//!
//! Writes happen on the coordinator path, so they stay synchronous and
//! cheap; the connection sits behind a `parking_lot::Mutex`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use tracing::{info, warn};

use crate::models::{JournalStatus, TradeRecord};

pub struct TradeJournal {
    conn: Mutex<Connection>,
    account: String,
}

impl TradeJournal {
    pub fn open(path: &Path, account: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open journal db {}", path.display()))?;
        let journal = Self {
            conn: Mutex::new(conn),
            account: account.to_string(),
        };
        journal.create_tables()?;
        journal.migrate()?;
        info!(db = %path.display(), account, "trade journal ready");
        Ok(journal)
    }

    #[cfg(test)]
    pub fn open_in_memory(account: &str) -> Result<Self> {
        let journal = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            account: account.to_string(),
        };
        journal.create_tables()?;
        journal.migrate()?;
        Ok(journal)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.lock().execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                ts        TEXT    NOT NULL,
                side      TEXT    NOT NULL,
                symbol    TEXT    NOT NULL,
                order_id  TEXT    NOT NULL,
                price     REAL,
                qty       REAL    NOT NULL,
                status    TEXT    NOT NULL,
                account   TEXT    NOT NULL DEFAULT ''
            )",
            [],
        )?;
        Ok(())
    }

    /// Older databases predate the `account` column; add it in place.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("PRAGMA table_info(trades)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        if !columns.iter().any(|c| c == "account") {
            conn.execute(
                "ALTER TABLE trades ADD COLUMN account TEXT NOT NULL DEFAULT ''",
                [],
            )?;
            info!("journal migrated: added account column");
        }
        Ok(())
    }

    fn insert(
        &self,
        side: &str,
        symbol: &str,
        order_id: &str,
        price: Option<f64>,
        qty: f64,
        status: JournalStatus,
    ) {
        let result = self.conn.lock().execute(
            "INSERT INTO trades (ts, side, symbol, order_id, price, qty, status, account)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                side,
                symbol,
                order_id,
                price,
                qty,
                status.as_str(),
                self.account,
            ],
        );
        if let Err(e) = result {
            // Journal loss is survivable; trading must not stop over it.
            warn!(error = %e, side, order_id, "journal insert failed");
        }
    }

    // ── writers ─────────────────────────────────────────────────────────

    pub fn log_spot_order(&self, symbol: &str, order_id: &str, price: f64, qty: f64) {
        self.insert("spot_buy", symbol, order_id, Some(price), qty, JournalStatus::Placed);
    }

    pub fn log_spot_fill(&self, symbol: &str, order_id: &str, price: f64, qty: f64) {
        self.insert("spot_buy", symbol, order_id, Some(price), qty, JournalStatus::Filled);
    }

    pub fn log_hedge(
        &self,
        symbol: &str,
        order_id: &str,
        qty: f64,
        success: bool,
        price: Option<f64>,
    ) {
        let status = if success {
            JournalStatus::HedgeOk
        } else {
            JournalStatus::HedgeFail
        };
        self.insert("futures_sell", symbol, order_id, price, qty, status);
    }

    pub fn log_close_order(&self, symbol: &str, order_id: &str, price: f64, qty: f64) {
        self.insert("spot_sell", symbol, order_id, Some(price), qty, JournalStatus::ClosePlaced);
    }

    pub fn log_close_fill(&self, symbol: &str, order_id: &str, price: f64, qty: f64) {
        self.insert("spot_sell", symbol, order_id, Some(price), qty, JournalStatus::CloseFilled);
    }

    pub fn log_close_hedge(&self, symbol: &str, order_id: &str, qty: f64, price: Option<f64>) {
        self.insert("futures_buy", symbol, order_id, price, qty, JournalStatus::HedgeOk);
    }

    // ── readers ─────────────────────────────────────────────────────────

    pub fn recent_trades(&self, limit: u32) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, side, symbol, order_id, price, qty, status, account
             FROM trades ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            let ts: String = row.get(1)?;
            Ok(TradeRecord {
                id: row.get(0)?,
                ts: ts
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                side: row.get(2)?,
                symbol: row.get(3)?,
                order_id: row.get(4)?,
                price: row.get(5)?,
                qty: row.get(6)?,
                status: row.get(7)?,
                account: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Aggregate bookkeeping over the whole journal: totals per side and
    /// hedge success counts.
    pub fn summary(&self) -> Result<JournalSummary> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN side='spot_buy' AND status='filled' THEN qty END), 0),
                COALESCE(SUM(CASE WHEN side='spot_buy' AND status='filled' THEN price * qty END), 0),
                COALESCE(SUM(CASE WHEN side='futures_sell' AND status='hedge_ok' THEN qty END), 0),
                COALESCE(SUM(CASE WHEN side='futures_sell' AND status='hedge_ok' THEN price * qty END), 0),
                COALESCE(SUM(CASE WHEN status='hedge_ok' THEN 1 END), 0),
                COALESCE(SUM(CASE WHEN status='hedge_fail' THEN 1 END), 0)
             FROM trades",
            [],
            |row| {
                Ok(JournalSummary {
                    total_bought_base: row.get(0)?,
                    total_buy_quote: row.get(1)?,
                    total_hedged_base: row.get(2)?,
                    total_hedge_quote: row.get(3)?,
                    hedge_ok_count: row.get(4)?,
                    hedge_fail_count: row.get(5)?,
                })
            },
        )
        .context("journal summary query failed")
    }
}

#[derive(Debug, Clone, Default)]
pub struct JournalSummary {
    pub total_bought_base: f64,
    pub total_buy_quote: f64,
    pub total_hedged_base: f64,
    pub total_hedge_quote: f64,
    pub hedge_ok_count: i64,
    pub hedge_fail_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_rows() {
        let journal = TradeJournal::open_in_memory("acct-1").unwrap();
        journal.log_spot_order("BTCUSDT", "1", 100.0, 0.002);
        journal.log_spot_fill("BTCUSDT", "1", 100.0, 0.002);
        journal.log_hedge("BTCUSDT", "perp-1", 0.002, true, Some(100.5));

        let rows = journal.recent_trades(10).unwrap();
        assert_eq!(rows.len(), 3);
        // newest first
        assert_eq!(rows[0].status, "hedge_ok");
        assert_eq!(rows[0].account, "acct-1");
        assert_eq!(rows[2].status, "placed");
    }

    #[test]
    fn summary_aggregates_fills_and_hedges() {
        let journal = TradeJournal::open_in_memory("").unwrap();
        journal.log_spot_fill("BTCUSDT", "1", 100.0, 0.002);
        journal.log_spot_fill("BTCUSDT", "2", 99.9, 0.003);
        journal.log_hedge("BTCUSDT", "p1", 0.005, true, Some(100.5));
        journal.log_hedge("BTCUSDT", "", 0.001, false, None);

        let s = journal.summary().unwrap();
        assert!((s.total_bought_base - 0.005).abs() < 1e-12);
        assert!((s.total_buy_quote - (0.2 + 0.2997)).abs() < 1e-9);
        assert!((s.total_hedged_base - 0.005).abs() < 1e-12);
        assert_eq!(s.hedge_ok_count, 1);
        assert_eq!(s.hedge_fail_count, 1);
    }

    #[test]
    fn migration_is_idempotent() {
        let journal = TradeJournal::open_in_memory("").unwrap();
        journal.migrate().unwrap();
        journal.log_spot_order("BTCUSDT", "1", 100.0, 0.002);
        assert_eq!(journal.recent_trades(5).unwrap().len(), 1);
    }

    #[test]
    fn opens_on_disk_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.db");
        {
            let journal = TradeJournal::open(&path, "a").unwrap();
            journal.log_spot_order("BTCUSDT", "1", 100.0, 0.002);
        }
        let journal = TradeJournal::open(&path, "a").unwrap();
        assert_eq!(journal.recent_trades(5).unwrap().len(), 1);
    }
}
