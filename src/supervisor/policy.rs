//! Restart policy and backoff controller
//!
//! Stateful decision engine between the health evaluator and the supervisor
//! loop: given a verdict and the restart history, decide whether to keep
//! going, restart now, or sit out a cooldown. All clock-dependent methods
//! take `now` explicitly so the loop passes `Utc::now()` and tests pass
//! fixed instants.

use crate::config::{RestartConfig, SupervisionConfig};
use crate::supervisor::health::HealthVerdict;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Worker healthy
    Running,
    /// Verdict failed, decision pending
    Unhealthy,
    /// Stop+respawn in progress
    Restarting,
    /// Restart budget exhausted, deliberately idle
    Cooldown,
    /// Terminal; shutdown or operator initiated
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Unhealthy => write!(f, "unhealthy"),
            SupervisorState::Restarting => write!(f, "restarting"),
            SupervisorState::Cooldown => write!(f, "cooldown"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a restart was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// Worker process exited or disappeared
    ProcessExit,
    /// Worker alive but heartbeat older than the timeout
    HeartbeatStale,
    /// Resident memory above the configured ceiling
    MemoryCeiling,
    /// Preventive restart after the forced-restart interval
    Scheduled,
    /// Operator initiated
    Manual,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::ProcessExit => write!(f, "process_exit"),
            RestartReason::HeartbeatStale => write!(f, "heartbeat_stale"),
            RestartReason::MemoryCeiling => write!(f, "memory_ceiling"),
            RestartReason::Scheduled => write!(f, "scheduled"),
            RestartReason::Manual => write!(f, "manual"),
        }
    }
}

/// What the supervisor loop should do this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Healthy, nothing to do
    Continue,
    /// Worker fine but the network probe failed; restarting would not help
    NetworkDegraded,
    /// Stop and respawn the worker
    Restart(RestartReason),
    /// In cooldown; make no spawn attempts
    CooldownWait { remaining: Duration },
}

/// Result of recording a spawn attempt with the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Respawn succeeded, back to running
    Running,
    /// Spawn failed; retry on the next unhealthy verdict
    RetryNext,
    /// Failure budget exhausted; no attempts until the deadline passes
    CooldownEntered { until: DateTime<Utc> },
}

/// Mutable policy bookkeeping, owned exclusively by [`RestartPolicy`]
#[derive(Debug, Clone)]
pub struct RestartPolicyState {
    pub state: SupervisorState,
    pub consecutive_failures: u32,
    pub attempts_since_cooldown: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub worker_started_at: Option<DateTime<Utc>>,
    /// First failure of the current rolling window
    first_failure_at: Option<DateTime<Utc>>,
    /// When the worker last became healthy
    became_running_at: Option<DateTime<Utc>>,
}

impl RestartPolicyState {
    fn new() -> Self {
        Self {
            state: SupervisorState::Running,
            consecutive_failures: 0,
            attempts_since_cooldown: 0,
            cooldown_until: None,
            worker_started_at: None,
            first_failure_at: None,
            became_running_at: None,
        }
    }
}

/// The restart decision engine
pub struct RestartPolicy {
    heartbeat_timeout: Duration,
    memory_ceiling_bytes: u64,
    max_consecutive_failures: u32,
    failure_window: ChronoDuration,
    cooldown: ChronoDuration,
    state: RestartPolicyState,
}

impl RestartPolicy {
    pub fn new(supervision: &SupervisionConfig, restart: &RestartConfig) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(supervision.heartbeat_timeout_secs),
            memory_ceiling_bytes: supervision.memory_ceiling_mb * 1024 * 1024,
            max_consecutive_failures: restart.max_consecutive_failures,
            failure_window: ChronoDuration::seconds(restart.failure_window_secs as i64),
            cooldown: ChronoDuration::seconds(restart.cooldown_secs as i64),
            state: RestartPolicyState::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state.state
    }

    pub fn snapshot(&self) -> &RestartPolicyState {
        &self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures
    }

    /// Map a failed verdict to the reason a restart would cite.
    /// Ordering matters: a dead process trumps a stale heartbeat.
    fn classify(&self, verdict: &HealthVerdict) -> Option<RestartReason> {
        if !verdict.process_alive {
            Some(RestartReason::ProcessExit)
        } else if verdict.heartbeat_stale(self.heartbeat_timeout) {
            Some(RestartReason::HeartbeatStale)
        } else if verdict.memory_exceeded(self.memory_ceiling_bytes) {
            Some(RestartReason::MemoryCeiling)
        } else {
            None
        }
    }

    /// Decide what the loop should do with this verdict
    pub fn decide(&mut self, verdict: &HealthVerdict, now: DateTime<Utc>) -> PolicyAction {
        match self.state.state {
            SupervisorState::Stopped => PolicyAction::Continue,
            SupervisorState::Cooldown => {
                let until = self.state.cooldown_until.unwrap_or(now);
                if now < until {
                    let remaining = (until - now).to_std().unwrap_or_default();
                    return PolicyAction::CooldownWait { remaining };
                }
                info!("Cooldown elapsed, failure counters reset");
                self.state.consecutive_failures = 0;
                self.state.attempts_since_cooldown = 0;
                self.state.first_failure_at = None;
                self.state.cooldown_until = None;
                self.transition(SupervisorState::Unhealthy);
                self.decide_active(verdict, now)
            }
            _ => self.decide_active(verdict, now),
        }
    }

    fn decide_active(&mut self, verdict: &HealthVerdict, now: DateTime<Utc>) -> PolicyAction {
        if let Some(reason) = self.classify(verdict) {
            self.transition(SupervisorState::Unhealthy);
            self.transition(SupervisorState::Restarting);
            return PolicyAction::Restart(reason);
        }

        if verdict.forced_restart_due {
            info!("Worker due for preventive restart");
            self.transition(SupervisorState::Restarting);
            return PolicyAction::Restart(RestartReason::Scheduled);
        }

        if self.state.state != SupervisorState::Running {
            self.transition(SupervisorState::Running);
            self.state.became_running_at = Some(now);
        }

        // A sustained healthy run clears the failure budget
        if self.state.consecutive_failures > 0 {
            let running_since = self.state.became_running_at.unwrap_or(now);
            if now - running_since > self.failure_window {
                info!(
                    "Healthy for {}s, resetting {} consecutive failures",
                    (now - running_since).num_seconds(),
                    self.state.consecutive_failures
                );
                self.state.consecutive_failures = 0;
                self.state.first_failure_at = None;
            }
        }

        if !verdict.network_ok {
            warn!("Network unreachable while worker is healthy; not restarting");
            return PolicyAction::NetworkDegraded;
        }

        PolicyAction::Continue
    }

    /// Record the outcome of a spawn attempt.
    ///
    /// A success returns to running without touching the failure budget (the
    /// budget clears only after a sustained healthy run); every failed spawn
    /// counts against it regardless of why the restart was attempted, so a
    /// preventive restart whose spawn fails is still a failure.
    pub fn record_spawn_result(&mut self, success: bool, now: DateTime<Utc>) -> SpawnOutcome {
        if success {
            self.state.worker_started_at = Some(now);
            self.state.became_running_at = Some(now);
            self.transition(SupervisorState::Running);
            return SpawnOutcome::Running;
        }

        // Stale window: a failure long after the last one starts a new count
        match self.state.first_failure_at {
            Some(first) if now - first <= self.failure_window => {}
            _ => {
                self.state.first_failure_at = Some(now);
                self.state.consecutive_failures = 0;
            }
        }
        self.state.consecutive_failures += 1;
        self.state.attempts_since_cooldown += 1;

        if self.state.consecutive_failures >= self.max_consecutive_failures {
            let until = now + self.cooldown;
            self.state.cooldown_until = Some(until);
            self.transition(SupervisorState::Cooldown);
            warn!(
                "{} consecutive failed restarts, cooling down until {}",
                self.state.consecutive_failures, until
            );
            SpawnOutcome::CooldownEntered { until }
        } else {
            self.transition(SupervisorState::Unhealthy);
            SpawnOutcome::RetryNext
        }
    }

    /// Terminal transition on shutdown; no further decisions are made
    pub fn stop(&mut self) {
        self.transition(SupervisorState::Stopped);
    }

    fn transition(&mut self, to: SupervisorState) {
        if self.state.state != to {
            info!("Supervisor state {} -> {}", self.state.state, to);
            self.state.state = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        policy_with(RestartConfig {
            max_consecutive_failures: 3,
            failure_window_secs: 300,
            cooldown_secs: 1200,
            forced_restart_secs: 0,
        })
    }

    fn policy_with(restart: RestartConfig) -> RestartPolicy {
        RestartPolicy::new(&SupervisionConfig::default(), &restart)
    }

    fn healthy() -> HealthVerdict {
        HealthVerdict {
            process_alive: true,
            heartbeat_age: Duration::from_secs(1),
            memory_bytes: Some(10 * 1024 * 1024),
            network_ok: true,
            forced_restart_due: false,
        }
    }

    fn dead() -> HealthVerdict {
        HealthVerdict {
            process_alive: false,
            heartbeat_age: Duration::MAX,
            memory_bytes: None,
            network_ok: true,
            forced_restart_due: false,
        }
    }

    #[test]
    fn healthy_verdict_continues() {
        let mut p = policy();
        assert_eq!(p.decide(&healthy(), Utc::now()), PolicyAction::Continue);
        assert_eq!(p.state(), SupervisorState::Running);
    }

    #[test]
    fn dead_process_restarts() {
        let mut p = policy();
        let action = p.decide(&dead(), Utc::now());
        assert_eq!(action, PolicyAction::Restart(RestartReason::ProcessExit));
        assert_eq!(p.state(), SupervisorState::Restarting);
    }

    #[test]
    fn stale_heartbeat_restarts_even_when_alive() {
        let mut p = policy();
        let verdict = HealthVerdict {
            heartbeat_age: Duration::from_secs(600),
            ..healthy()
        };
        assert_eq!(
            p.decide(&verdict, Utc::now()),
            PolicyAction::Restart(RestartReason::HeartbeatStale)
        );
    }

    #[test]
    fn memory_ceiling_restarts() {
        let mut p = RestartPolicy::new(
            &SupervisionConfig {
                memory_ceiling_mb: 100,
                ..SupervisionConfig::default()
            },
            &RestartConfig::default(),
        );
        let verdict = HealthVerdict {
            memory_bytes: Some(200 * 1024 * 1024),
            ..healthy()
        };
        assert_eq!(
            p.decide(&verdict, Utc::now()),
            PolicyAction::Restart(RestartReason::MemoryCeiling)
        );
    }

    #[test]
    fn network_only_degradation_stays_running() {
        let mut p = policy();
        let verdict = HealthVerdict {
            network_ok: false,
            ..healthy()
        };
        assert_eq!(p.decide(&verdict, Utc::now()), PolicyAction::NetworkDegraded);
        assert_eq!(p.state(), SupervisorState::Running);
        assert_eq!(p.consecutive_failures(), 0);
    }

    #[test]
    fn network_down_with_dead_process_still_restarts() {
        let mut p = policy();
        let verdict = HealthVerdict {
            network_ok: false,
            ..dead()
        };
        assert_eq!(
            p.decide(&verdict, Utc::now()),
            PolicyAction::Restart(RestartReason::ProcessExit)
        );
    }

    #[test]
    fn forced_restart_is_scheduled_and_bypasses_counting() {
        let mut p = policy();
        let verdict = HealthVerdict {
            forced_restart_due: true,
            ..healthy()
        };
        let now = Utc::now();
        assert_eq!(
            p.decide(&verdict, now),
            PolicyAction::Restart(RestartReason::Scheduled)
        );
        let outcome = p.record_spawn_result(true, now);
        assert_eq!(outcome, SpawnOutcome::Running);
        assert_eq!(p.consecutive_failures(), 0);
    }

    #[test]
    fn third_failure_enters_cooldown() {
        let mut p = policy();
        let now = Utc::now();
        for i in 1..=2 {
            let outcome = p.record_spawn_result(false, now);
            assert_eq!(outcome, SpawnOutcome::RetryNext);
            assert_eq!(p.consecutive_failures(), i);
        }
        match p.record_spawn_result(false, now) {
            SpawnOutcome::CooldownEntered { until } => {
                assert_eq!(until, now + ChronoDuration::seconds(1200));
            }
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert_eq!(p.state(), SupervisorState::Cooldown);
    }

    #[test]
    fn cooldown_makes_no_spawn_attempts() {
        let mut p = policy();
        let now = Utc::now();
        for _ in 0..3 {
            p.record_spawn_result(false, now);
        }
        match p.decide(&dead(), now + ChronoDuration::seconds(60)) {
            PolicyAction::CooldownWait { remaining } => {
                assert!(remaining <= Duration::from_secs(1140));
            }
            other => panic!("expected cooldown wait, got {:?}", other),
        }
    }

    #[test]
    fn cooldown_expiry_resets_counters_and_retries() {
        let mut p = policy();
        let now = Utc::now();
        for _ in 0..3 {
            p.record_spawn_result(false, now);
        }
        let after = now + ChronoDuration::seconds(1201);
        assert_eq!(
            p.decide(&dead(), after),
            PolicyAction::Restart(RestartReason::ProcessExit)
        );
        assert_eq!(p.consecutive_failures(), 0);
    }

    #[test]
    fn cooldown_expiry_with_healthy_worker_returns_to_running() {
        let mut p = policy();
        let now = Utc::now();
        for _ in 0..3 {
            p.record_spawn_result(false, now);
        }
        let after = now + ChronoDuration::seconds(1201);
        assert_eq!(p.decide(&healthy(), after), PolicyAction::Continue);
        assert_eq!(p.state(), SupervisorState::Running);
    }

    #[test]
    fn sustained_healthy_run_resets_failures() {
        let mut p = policy();
        let now = Utc::now();
        p.record_spawn_result(false, now);
        p.record_spawn_result(true, now);
        assert_eq!(p.consecutive_failures(), 1);

        // Still inside the rolling window: counter untouched
        let midway = now + ChronoDuration::seconds(100);
        assert_eq!(p.decide(&healthy(), midway), PolicyAction::Continue);
        assert_eq!(p.consecutive_failures(), 1);

        // Beyond the window: counter cleared
        let later = now + ChronoDuration::seconds(301);
        assert_eq!(p.decide(&healthy(), later), PolicyAction::Continue);
        assert_eq!(p.consecutive_failures(), 0);
    }

    #[test]
    fn failures_outside_window_start_a_fresh_count() {
        let mut p = policy();
        let now = Utc::now();
        p.record_spawn_result(false, now);
        p.record_spawn_result(false, now);
        assert_eq!(p.consecutive_failures(), 2);

        // Third failure lands long after the window; count restarts at one
        let later = now + ChronoDuration::seconds(600);
        let outcome = p.record_spawn_result(false, later);
        assert_eq!(outcome, SpawnOutcome::RetryNext);
        assert_eq!(p.consecutive_failures(), 1);
    }

    #[test]
    fn stopped_is_terminal() {
        let mut p = policy();
        p.stop();
        assert_eq!(p.decide(&dead(), Utc::now()), PolicyAction::Continue);
        assert_eq!(p.state(), SupervisorState::Stopped);
    }

    #[test]
    fn reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RestartReason::Scheduled).unwrap(),
            "\"scheduled\""
        );
        assert_eq!(
            serde_json::to_string(&RestartReason::HeartbeatStale).unwrap(),
            "\"heartbeat_stale\""
        );
    }
}
