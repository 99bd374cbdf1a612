//! Process-wide engine state: the live ladder, the budget ledger, and the
//! pause/requote/running flags.
//!
//! Everything mutable sits behind one `parking_lot::Mutex` (plus an atomic
//! for the lifecycle flag). The lock is never held across venue I/O — the
//! hedge path snapshots, calls out, and re-enters to commit.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::FeeConfig;
use crate::models::{ActiveOrderView, BookLevel, CloseStatus, StatusSnapshot};

/// Float tolerance for quantity comparisons.
pub const EPS: f64 = 1e-12;

/// Open-ladder weights per level index. Sums to 1.0.
pub const LEVEL_WEIGHTS: [(u8, f64); 3] = [(1, 0.20), (2, 0.30), (3, 0.50)];

/// Floors a quantity to the lot grid. The nudge keeps binary representation
/// noise (e.g. 0.002 / 0.00001 = 199.999...97) from eating a whole lot.
pub fn floor_to_lot(qty: f64, lot: f64) -> f64 {
    if lot <= 0.0 {
        return qty;
    }
    (qty / lot + 1e-9).floor() * lot
}

/// One live passive buy order.
///
/// Invariant: `0 <= hedged_qty <= accounted_qty <= qty` (up to [`EPS`]).
#[derive(Debug, Clone)]
pub struct LevelOrder {
    pub level: u8,
    pub order_id: String,
    pub price: f64,
    pub qty: f64,
    /// Cumulative base already credited to the budget ledger.
    pub accounted_qty: f64,
    /// Cumulative base already covered by a perp sell.
    pub hedged_qty: f64,
}

impl LevelOrder {
    pub fn new(level: u8, order_id: String, price: f64, qty: f64) -> Self {
        Self {
            level,
            order_id,
            price,
            qty,
            accounted_qty: 0.0,
            hedged_qty: 0.0,
        }
    }
}

/// Cumulative accounting, base units unless suffixed `_quote`.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub total_filled_base: f64,
    pub total_filled_quote: f64,
    pub total_hedged_base: f64,
    pub total_hedged_quote: f64,
    /// Subset of `total_hedged_base` for which an avg price was observable.
    pub total_hedged_base_priced: f64,
    /// Base known long spot but not yet short perp.
    pub naked_exposure: f64,
}

impl Ledger {
    pub fn spot_avg_price(&self) -> Option<f64> {
        (self.total_filled_base > EPS).then(|| self.total_filled_quote / self.total_filled_base)
    }

    pub fn perp_avg_price(&self) -> Option<f64> {
        (self.total_hedged_base_priced > EPS)
            .then(|| self.total_hedged_quote / self.total_hedged_base_priced)
    }
}

/// Everything behind the state lock.
pub struct StateInner {
    pub active_orders: HashMap<String, LevelOrder>,
    /// level index -> order id; bijective with a subset of `active_orders`.
    pub level_to_oid: BTreeMap<u8, String>,
    pub paused: bool,
    /// One-shot: set when the level-1 order fully fills, consumed by the
    /// coordinator to rebuild the whole ladder around the new top of book.
    pub requote_all_levels: bool,
    pub ledger: Ledger,
    pub total_budget_base: f64,
    pub manual_min_spread_bps: Option<f64>,
}

pub struct EngineState {
    inner: Mutex<StateInner>,
    running: AtomicBool,
    fee: FeeConfig,
}

impl EngineState {
    pub fn new(total_budget_base: f64, fee: FeeConfig) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                active_orders: HashMap::new(),
                level_to_oid: BTreeMap::new(),
                paused: true,
                requote_all_levels: false,
                ledger: Ledger::default(),
                total_budget_base,
                manual_min_spread_bps: None,
            }),
            running: AtomicBool::new(true),
            fee,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    // ── guarded setters ─────────────────────────────────────────────────

    pub fn set_budget(&self, budget: f64) {
        self.lock().total_budget_base = budget;
    }

    pub fn budget(&self) -> f64 {
        self.lock().total_budget_base
    }

    pub fn set_manual_min_spread_bps(&self, bps: f64) {
        self.lock().manual_min_spread_bps = Some(bps);
    }

    pub fn clear_manual_min_spread_bps(&self) {
        self.lock().manual_min_spread_bps = None;
    }

    /// Effective minimum spread as a fraction. Manual override wins over the
    /// fee-derived auto value.
    pub fn min_spread(&self) -> f64 {
        match self.lock().manual_min_spread_bps {
            Some(bps) => bps / 10_000.0,
            None => self.fee.auto_min_spread(),
        }
    }

    pub fn min_spread_bps(&self) -> f64 {
        self.min_spread() * 10_000.0
    }

    pub fn spread_mode(&self) -> &'static str {
        if self.lock().manual_min_spread_bps.is_some() {
            "manual"
        } else {
            "auto"
        }
    }

    pub fn fee(&self) -> &FeeConfig {
        &self.fee
    }

    // ── requote flag ────────────────────────────────────────────────────

    pub fn set_requote_all(&self) {
        self.lock().requote_all_levels = true;
    }

    /// Reads and clears the one-shot flag.
    pub fn take_requote_all(&self) -> bool {
        let mut inner = self.lock();
        std::mem::take(&mut inner.requote_all_levels)
    }

    // ── ladder mutation (bijection enforced here) ───────────────────────

    /// Registers a freshly placed order. Panics in debug builds if the level
    /// or order id is already occupied — callers must have synchronized.
    pub fn insert_order(&self, order: LevelOrder) {
        let mut inner = self.lock();
        debug_assert!(
            !inner.active_orders.contains_key(&order.order_id),
            "duplicate order id {}",
            order.order_id
        );
        debug_assert!(
            !inner.level_to_oid.contains_key(&order.level),
            "level {} already quoted",
            order.level
        );
        inner.level_to_oid.insert(order.level, order.order_id.clone());
        inner.active_orders.insert(order.order_id.clone(), order);
    }

    /// Removes an order from both maps. Returns it when it existed.
    pub fn remove_order(&self, order_id: &str) -> Option<LevelOrder> {
        let mut inner = self.lock();
        let order = inner.active_orders.remove(order_id)?;
        inner.level_to_oid.remove(&order.level);
        Some(order)
    }

    /// Live `(level, order_id)` pairs, ascending by level.
    pub fn ladder(&self) -> Vec<(u8, String)> {
        self.lock()
            .level_to_oid
            .iter()
            .map(|(&lv, oid)| (lv, oid.clone()))
            .collect()
    }

    pub fn order_count(&self) -> usize {
        self.lock().active_orders.len()
    }

    pub fn ledger(&self) -> Ledger {
        self.lock().ledger.clone()
    }

    pub fn naked_exposure(&self) -> f64 {
        self.lock().ledger.naked_exposure
    }

    // ── invariants (checkable after every coordinator tick) ─────────────

    /// Verifies the per-order and ledger invariants, returning the first
    /// violation found.
    pub fn check_invariants(&self, lot: f64) -> Result<(), String> {
        let inner = self.lock();

        for (oid, order) in &inner.active_orders {
            if order.hedged_qty < -EPS
                || order.hedged_qty > order.accounted_qty + EPS
                || order.accounted_qty > order.qty + EPS
            {
                return Err(format!(
                    "order {oid} violates 0 <= hedged {} <= accounted {} <= qty {}",
                    order.hedged_qty, order.accounted_qty, order.qty
                ));
            }
            match inner.level_to_oid.get(&order.level) {
                Some(mapped) if mapped == oid => {}
                other => {
                    return Err(format!(
                        "bijection broken: order {oid} at level {} maps to {:?}",
                        order.level, other
                    ));
                }
            }
        }
        if inner.level_to_oid.len() != inner.active_orders.len() {
            return Err(format!(
                "bijection broken: {} levels vs {} orders",
                inner.level_to_oid.len(),
                inner.active_orders.len()
            ));
        }

        let ledger = &inner.ledger;
        let gap = ledger.total_filled_base - ledger.total_hedged_base - ledger.naked_exposure;
        if gap.abs() >= 2.0 * lot {
            return Err(format!(
                "ledger gap {gap} exceeds 2 lots (filled {}, hedged {}, naked {})",
                ledger.total_filled_base, ledger.total_hedged_base, ledger.naked_exposure
            ));
        }
        if ledger.total_filled_base > inner.total_budget_base + lot {
            return Err(format!(
                "filled {} exceeds budget {} + lot",
                ledger.total_filled_base, inner.total_budget_base
            ));
        }
        Ok(())
    }

    // ── status ──────────────────────────────────────────────────────────

    /// Assembles the operator-facing snapshot. `spot_bids` is used to report
    /// where each quote currently sits in the visible book.
    pub fn status_snapshot(
        &self,
        symbol_spot: &str,
        symbol_perp: &str,
        spot_bids: &[BookLevel],
        close: CloseStatus,
    ) -> StatusSnapshot {
        let inner = self.lock();
        let ledger = &inner.ledger;

        let mut active_orders: Vec<ActiveOrderView> = inner
            .level_to_oid
            .iter()
            .filter_map(|(&lv, oid)| inner.active_orders.get(oid).map(|o| (lv, o)))
            .map(|(lv, o)| ActiveOrderView {
                level: lv,
                current_level: spot_bids
                    .iter()
                    .position(|b| (b.price - o.price).abs() < EPS)
                    .map(|i| (i + 1) as u8),
                id: o.order_id.clone(),
                price: o.price,
                qty: o.qty,
                filled: o.accounted_qty,
                hedged: o.hedged_qty,
            })
            .collect();
        active_orders.sort_by_key(|o| o.level);

        let used = ledger.total_filled_base;
        StatusSnapshot {
            paused: inner.paused,
            running: self.is_running(),
            symbol_spot: symbol_spot.to_string(),
            symbol_perp: symbol_perp.to_string(),
            budget: inner.total_budget_base,
            used,
            remaining: (inner.total_budget_base - used).max(0.0),
            spot_filled_base: ledger.total_filled_base,
            perp_hedged_base: ledger.total_hedged_base,
            naked_exposure: ledger.naked_exposure,
            spot_avg_price: ledger.spot_avg_price(),
            perp_avg_price: ledger.perp_avg_price(),
            perp_avg_priced_base: ledger.total_hedged_base_priced,
            min_profit_bps: self.fee.min_profit_bps,
            min_spread_bps: match inner.manual_min_spread_bps {
                Some(bps) => bps,
                None => self.fee.auto_min_spread() * 10_000.0,
            },
            spread_mode: if inner.manual_min_spread_bps.is_some() {
                "manual".to_string()
            } else {
                "auto".to_string()
            },
            active_orders,
            close_task: close,
        }
    }
}
