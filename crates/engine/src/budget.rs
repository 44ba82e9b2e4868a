//! Per-caller spend tracking over rolling windows.
//!
//! Admission and accounting are separate steps. [`BudgetGuard::admit`] only
//! checks the caller's window; [`BudgetGuard::commit`] adds the actual cost
//! after the work is done. Nothing is reserved at admission, so concurrent
//! requests from one caller can all be admitted against the same remaining
//! amount and together overshoot the cap by up to one request's cost each.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use pipeline::{CallerId, CostBudget, PipelineError, Timestamp, TokenCost};

pub const DEFAULT_CAP_USD: f64 = 10.0;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetConfig {
    pub cap: CostBudget,
    pub window: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cap: CostBudget::new(DEFAULT_CAP_USD).expect("default cap is positive"),
            window: DEFAULT_WINDOW,
        }
    }
}

/// Spend accumulated by one caller since `window_start`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendWindow {
    pub spent: TokenCost,
    pub window_start: Timestamp,
}

impl SpendWindow {
    fn open(now: Timestamp) -> Self {
        Self {
            spent: TokenCost::zero(),
            window_start: now,
        }
    }

    /// A window has expired once more than `window` has passed since it opened.
    pub fn is_expired(&self, now: Timestamp, window: Duration) -> bool {
        now.duration_since(self.window_start) > window
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub spent: TokenCost,
    pub remaining: TokenCost,
    pub cap: CostBudget,
}

impl BudgetDecision {
    /// The boundary error for a refused admission.
    pub fn into_error(self, caller: &CallerId) -> Option<PipelineError> {
        (!self.allowed).then(|| PipelineError::BudgetExceeded {
            caller: caller.clone(),
            spent: self.spent,
            limit: self.cap,
        })
    }
}

/// Tracks spend per caller and admits or refuses new requests.
#[derive(Debug, Default)]
pub struct BudgetGuard {
    config: BudgetConfig,
    windows: Mutex<HashMap<CallerId, SpendWindow>>,
}

impl BudgetGuard {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BudgetConfig {
        self.config
    }

    /// Checks `caller` against the configured cap.
    pub fn admit(&self, caller: &CallerId, estimate: TokenCost) -> BudgetDecision {
        self.admit_at(caller, None, estimate, Timestamp::now())
    }

    /// Checks `caller` against `cap` instead of the configured cap.
    pub fn admit_with_cap(
        &self,
        caller: &CallerId,
        cap: Option<CostBudget>,
        estimate: TokenCost,
    ) -> BudgetDecision {
        self.admit_at(caller, cap, estimate, Timestamp::now())
    }

    /// Admission check evaluated at `now`.
    ///
    /// Opens the caller's window on first sight and resets it if it has
    /// expired. A caller is admitted while its spend is strictly below the
    /// cap. `estimate` is informational and is not reserved.
    pub fn admit_at(
        &self,
        caller: &CallerId,
        cap: Option<CostBudget>,
        estimate: TokenCost,
        now: Timestamp,
    ) -> BudgetDecision {
        let cap = cap.unwrap_or(self.config.cap);
        let spent = {
            let mut windows = self.windows.lock();
            let entry = self.current_window(&mut windows, caller, now);
            entry.spent
        };
        let allowed = !cap.is_exceeded_by(spent);
        let decision = BudgetDecision {
            allowed,
            spent,
            remaining: cap.remaining_after(spent),
            cap,
        };
        debug!(
            %caller,
            allowed,
            spent = %spent,
            remaining = %decision.remaining,
            estimate = %estimate,
            "budget admission"
        );
        decision
    }

    /// Adds `cost` to the caller's current window and returns the new total.
    pub fn commit(&self, caller: &CallerId, cost: TokenCost) -> TokenCost {
        self.commit_at(caller, cost, Timestamp::now())
    }

    pub fn commit_at(&self, caller: &CallerId, cost: TokenCost, now: Timestamp) -> TokenCost {
        let mut windows = self.windows.lock();
        let entry = self.current_window(&mut windows, caller, now);
        entry.spent += cost;
        let total = entry.spent;
        drop(windows);
        info!(%caller, committed = %cost, spent = %total, "cost committed");
        total
    }

    /// Spend in the caller's current window. Zero for unknown callers.
    pub fn spent(&self, caller: &CallerId) -> TokenCost {
        self.spent_at(caller, Timestamp::now())
    }

    pub fn spent_at(&self, caller: &CallerId, now: Timestamp) -> TokenCost {
        self.windows
            .lock()
            .get(caller)
            .filter(|w| !w.is_expired(now, self.config.window))
            .map_or_else(TokenCost::zero, |w| w.spent)
    }

    /// What the caller may still spend under `cap` (or the configured cap).
    pub fn remaining(&self, caller: &CallerId, cap: Option<CostBudget>) -> TokenCost {
        cap.unwrap_or(self.config.cap)
            .remaining_after(self.spent(caller))
    }

    /// Snapshot of the caller's window, if one is open.
    pub fn window(&self, caller: &CallerId) -> Option<SpendWindow> {
        self.windows.lock().get(caller).copied()
    }

    /// Drops windows that have expired; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Timestamp::now())
    }

    pub fn evict_expired_at(&self, now: Timestamp) -> usize {
        let window = self.config.window;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| !w.is_expired(now, window));
        before - windows.len()
    }

    fn current_window<'a>(
        &self,
        windows: &'a mut HashMap<CallerId, SpendWindow>,
        caller: &CallerId,
        now: Timestamp,
    ) -> &'a mut SpendWindow {
        let window = self.config.window;
        let entry = windows
            .entry(caller.clone())
            .or_insert_with(|| SpendWindow::open(now));
        if entry.is_expired(now, window) {
            debug!(%caller, "spend window expired; resetting");
            *entry = SpendWindow::open(now);
        }
        entry
    }
}
