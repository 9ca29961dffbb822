//! Per-target circuit breaker gating whether automated recovery is
//! attempted at all. While a target's circuit is open, new incidents for it
//! escalate immediately with zero gateway calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker whether an incident may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, execute normally.
    Allow,
    /// Cooldown elapsed; this incident is the single half-open trial.
    Trial,
    /// Circuit open (or a trial is already in flight), escalate immediately.
    Reject,
}

#[derive(Debug)]
struct TargetState {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl TargetState {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            cooldown,
            trial_in_flight: false,
        }
    }
}

pub struct CircuitBreaker {
    targets: Mutex<HashMap<String, TargetState>>,
    failure_threshold: u32,
    base_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, base_cooldown: Duration) -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            failure_threshold,
            base_cooldown,
        }
    }

    pub fn admit(&self, target: &str) -> Admission {
        let mut targets = self.targets.lock().expect("breaker lock poisoned");
        let entry = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::new(self.base_cooldown));

        match entry.state {
            BreakerState::Closed => Admission::Allow,
            BreakerState::Open => {
                let cooled_down = entry
                    .last_failure
                    .map(|at| at.elapsed() >= entry.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    entry.state = BreakerState::HalfOpen;
                    entry.trial_in_flight = true;
                    info!(target, "Circuit half-open, admitting trial incident");
                    Admission::Trial
                } else {
                    Admission::Reject
                }
            }
            BreakerState::HalfOpen => {
                if entry.trial_in_flight {
                    Admission::Reject
                } else {
                    entry.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    pub fn is_open(&self, target: &str) -> bool {
        let targets = self.targets.lock().expect("breaker lock poisoned");
        targets
            .get(target)
            .map(|t| t.state == BreakerState::Open)
            .unwrap_or(false)
    }

    /// Records the terminal outcome of an admitted incident. RESOLVED resets
    /// the target; ESCALATED and ABORTED count as failures.
    pub fn record(&self, target: &str, resolved: bool) {
        let mut targets = self.targets.lock().expect("breaker lock poisoned");

        if resolved {
            // A resolved target is indistinguishable from an unknown one, so
            // the entry is dropped rather than reset; the map stays bounded
            // by the number of currently-failing targets.
            if let Some(entry) = targets.remove(target) {
                if entry.state == BreakerState::HalfOpen {
                    info!(target, "Trial incident resolved, circuit closed");
                }
            }
            return;
        }

        let entry = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::new(self.base_cooldown));
        let was_trial = entry.state == BreakerState::HalfOpen;
        entry.trial_in_flight = false;
        entry.failure_count += 1;
        entry.last_failure = Some(Instant::now());
        if was_trial {
            // Failed trial: reopen with an extended cooldown.
            entry.state = BreakerState::Open;
            entry.cooldown *= 2;
            warn!(target, cooldown_secs = entry.cooldown.as_secs(), "Trial incident failed, circuit reopened");
        } else if entry.failure_count >= self.failure_threshold {
            entry.state = BreakerState::Open;
            warn!(target, failures = entry.failure_count, "Failure threshold reached, circuit opened");
        }
    }

    /// Number of targets currently holding breaker state.
    pub fn tracked_targets(&self) -> usize {
        self.targets.lock().expect("breaker lock poisoned").len()
    }

    pub fn failure_count(&self, target: &str) -> u32 {
        let targets = self.targets.lock().expect("breaker lock poisoned");
        targets.get(target).map(|t| t.failure_count).unwrap_or(0)
    }

    pub fn state(&self, target: &str) -> BreakerState {
        let targets = self.targets.lock().expect("breaker lock poisoned");
        targets
            .get(target)
            .map(|t| t.state)
            .unwrap_or(BreakerState::Closed)
    }
}
