//! Adaptive throttle governor for Graph traffic
//!
//! Every Graph call reports its outcome here; the transfer scheduler asks it
//! how many transfers may run. The policy is circuit-like:
//!
//! - three consecutive 429/5xx responses within 60 seconds halve the active
//!   transfer budget (never below 1);
//! - 60 seconds of clean responses double it again, up to the configured
//!   maximum.
//!
//! A single governor instance is shared by the client and the scheduler.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Failures inside this window count toward the trip threshold
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Consecutive throttle responses that trip a halving
const TRIP_THRESHOLD: u32 = 3;

/// Clean time required before the budget is raised again
const RECOVERY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct GovernorState {
    /// Current concurrent-transfer budget
    budget: usize,
    /// Consecutive 429/5xx responses observed
    consecutive_failures: u32,
    /// When the current failure streak began
    streak_started: Option<Instant>,
    /// Last throttle observed (any streak)
    last_failure: Option<Instant>,
    /// Last time the budget was raised
    last_raise: Instant,
}

/// Shared adaptive budget for concurrent transfers
#[derive(Debug)]
pub struct ThrottleGovernor {
    max_budget: usize,
    state: Mutex<GovernorState>,
}

impl ThrottleGovernor {
    /// Create a governor with the configured maximum budget
    #[must_use]
    pub fn new(max_budget: usize) -> Self {
        let max_budget = max_budget.max(1);
        Self {
            max_budget,
            state: Mutex::new(GovernorState {
                budget: max_budget,
                consecutive_failures: 0,
                streak_started: None,
                last_failure: None,
                last_raise: Instant::now(),
            }),
        }
    }

    /// The number of transfers allowed to run right now
    pub fn current_budget(&self) -> usize {
        self.state.lock().unwrap().budget
    }

    /// The configured maximum
    pub fn max_budget(&self) -> usize {
        self.max_budget
    }

    /// Report a 429 or 5xx response
    pub fn record_throttle(&self) {
        self.record_throttle_at(Instant::now());
    }

    /// Report a successful response
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    fn record_throttle_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();

        // A stale streak restarts rather than accumulates
        match state.streak_started {
            Some(start) if now.duration_since(start) <= FAILURE_WINDOW => {
                state.consecutive_failures += 1;
            }
            _ => {
                state.streak_started = Some(now);
                state.consecutive_failures = 1;
            }
        }
        state.last_failure = Some(now);

        if state.consecutive_failures >= TRIP_THRESHOLD {
            let halved = (state.budget / 2).max(1);
            if halved < state.budget {
                info!(
                    from = state.budget,
                    to = halved,
                    "Throttle streak tripped; halving transfer budget"
                );
                state.budget = halved;
            }
            state.consecutive_failures = 0;
            state.streak_started = None;
        } else {
            debug!(
                streak = state.consecutive_failures,
                "Throttle response recorded"
            );
        }
    }

    fn record_success_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.streak_started = None;

        if state.budget >= self.max_budget {
            return;
        }

        let clean_since_failure = state
            .last_failure
            .map(|t| now.duration_since(t) >= RECOVERY_WINDOW)
            .unwrap_or(true);
        let clean_since_raise = now.duration_since(state.last_raise) >= RECOVERY_WINDOW;

        if clean_since_failure && clean_since_raise {
            let doubled = (state.budget * 2).min(self.max_budget);
            info!(
                from = state.budget,
                to = doubled,
                "Clean window elapsed; raising transfer budget"
            );
            state.budget = doubled;
            state.last_raise = now;
        }
    }
}

impl onesync_core::ports::remote_drive::TransferBudget for ThrottleGovernor {
    fn current_budget(&self) -> usize {
        ThrottleGovernor::current_budget(self)
    }
}
