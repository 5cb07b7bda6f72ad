//! Supervisor loop
//!
//! Owns the worker's process lifecycle and runs the poll-evaluate-decide-act
//! cycle on a fixed cadence. Cycles never overlap: a restart blocks the loop
//! until the spawn completes or times out, so decisions are never made
//! against a worker whose replacement is still starting.

use crate::config::AppConfig;
use crate::error::{Result, WardenError};
use crate::supervisor::guard::{InstanceGuard, LockState};
use crate::supervisor::health::{HealthEvaluator, WorkerView};
use crate::supervisor::heartbeat::HeartbeatFile;
use crate::supervisor::ledger::{RestartLedger, RestartOutcome};
use crate::supervisor::notifier::{AlertSink, IncidentNotifier, WebhookNotifier};
use crate::supervisor::policy::{
    PolicyAction, RestartPolicy, RestartReason, SpawnOutcome, SupervisorState,
};
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// The currently supervised OS process
pub struct WorkerHandle {
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    exited: bool,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn view(&self) -> WorkerView {
        WorkerView {
            pid: self.pid,
            started_at: self.started_at,
        }
    }

    /// Collect the exit status if the worker has died, so it never lingers
    /// as a zombie between polls
    fn reap(&mut self) {
        if self.exited {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            info!("Worker PID {} exited: {}", self.pid, status);
            self.exited = true;
        }
    }
}

/// What a single supervision cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Worker healthy, nothing done
    Healthy,
    /// Worker healthy but the network probe failed; logged only
    NetworkDegraded,
    /// Worker stopped and respawned successfully
    Restarted,
    /// Restart attempted and failed
    RestartFailed,
    /// This cycle's failure exhausted the budget
    CooldownEntered,
    /// Sitting out a cooldown, no spawn attempted
    CoolingDown,
    /// Supervisor is stopped
    Stopped,
}

/// Orchestrates guard, heartbeat, evaluator, policy, ledger, and notifier
pub struct Supervisor {
    config: AppConfig,
    heartbeat: HeartbeatFile,
    evaluator: HealthEvaluator,
    policy: RestartPolicy,
    ledger: RestartLedger,
    notifier: IncidentNotifier,
    guard: InstanceGuard,
    lock: Option<LockState>,
    worker: Option<WorkerHandle>,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Result<Self> {
        let sink: Option<Arc<dyn AlertSink>> = match config.notify.webhook_url.as_ref() {
            Some(url) => Some(WebhookNotifier::new(url.clone())),
            None => WebhookNotifier::from_env().map(|n| n as Arc<dyn AlertSink>),
        };
        Self::with_sink(config, sink)
    }

    /// Construction seam used by tests to observe notifications
    pub fn with_sink(config: AppConfig, sink: Option<Arc<dyn AlertSink>>) -> Result<Self> {
        config.validate()?;

        let heartbeat = HeartbeatFile::new(config.paths.heartbeat_file());
        let evaluator = HealthEvaluator::new(
            config.restart.clone(),
            config.network.clone(),
            heartbeat.clone(),
        );
        let policy = RestartPolicy::new(&config.supervision, &config.restart);
        let ledger = RestartLedger::new(config.paths.ledger_file(), config.ledger.max_entries);
        let notifier = IncidentNotifier::new(sink, config.notify.failure_threshold);
        let guard = InstanceGuard::new(
            config.paths.lock_file(),
            config.supervision.auto_takeover,
            Duration::from_secs(config.supervision.stop_grace_secs),
        );

        Ok(Self {
            config,
            heartbeat,
            evaluator,
            policy,
            ledger,
            notifier,
            guard,
            lock: None,
            worker: None,
        })
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &RestartLedger {
        &self.ledger
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.pid)
    }

    /// Acquire the instance lock and spawn the worker for the first time.
    ///
    /// An unusable lock or ledger aborts startup; a failing worker spawn does
    /// not — it is counted and retried by the normal policy cycle.
    pub async fn start(&mut self) -> Result<()> {
        self.lock = Some(self.guard.acquire()?);
        self.ledger.ensure_writable()?;

        match self.attempt_spawn().await {
            Ok(()) => {
                self.policy.record_spawn_result(true, Utc::now());
                info!(
                    "Supervising worker PID {} ({})",
                    self.worker_pid().unwrap_or_default(),
                    self.config.worker.command.join(" ")
                );
            }
            Err(detail) => {
                error!("Initial worker spawn failed: {}", detail);
                self.policy.record_spawn_result(false, Utc::now());
            }
        }
        Ok(())
    }

    /// Run until a shutdown signal arrives
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.supervision.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Registered once so a signal landing mid-cycle is never dropped
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Supervision cycle failed: {}", e);
                    }
                    if self.policy.state() == SupervisorState::Stopped {
                        break;
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.shutdown().await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// One poll-evaluate-decide-act cycle
    pub async fn tick(&mut self) -> Result<CycleOutcome> {
        if self.policy.state() == SupervisorState::Stopped {
            return Ok(CycleOutcome::Stopped);
        }

        if let Some(worker) = self.worker.as_mut() {
            worker.reap();
        }
        let view = self
            .worker
            .as_ref()
            .filter(|w| !w.exited)
            .map(|w| w.view());
        let verdict = self.evaluator.evaluate(view).await;
        let now = Utc::now();

        match self.policy.decide(&verdict, now) {
            PolicyAction::Continue => {
                if self.policy.state() == SupervisorState::Running {
                    self.notifier.notify_recovered().await;
                }
                Ok(CycleOutcome::Healthy)
            }
            PolicyAction::NetworkDegraded => Ok(CycleOutcome::NetworkDegraded),
            PolicyAction::CooldownWait { remaining } => {
                debug!("In cooldown for another {}s", remaining.as_secs());
                Ok(CycleOutcome::CoolingDown)
            }
            PolicyAction::Restart(reason) => self.restart_worker(reason).await,
        }
    }

    /// Stop worker, release the lock, refuse further work. The sequence has
    /// no knowledge of worker internals and is safe to run more than once.
    pub async fn shutdown(&mut self) {
        self.policy.stop();
        self.stop_worker().await;
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
        info!("Supervisor stopped");
    }

    async fn restart_worker(&mut self, reason: RestartReason) -> Result<CycleOutcome> {
        info!("Restarting worker ({})", reason);
        self.stop_worker().await;

        match self.attempt_spawn().await {
            Ok(()) => {
                self.policy.record_spawn_result(true, Utc::now());
                self.record(reason, RestartOutcome::Success, None);
                self.notifier.notify_recovered().await;
                info!(
                    "Worker restarted (PID {})",
                    self.worker_pid().unwrap_or_default()
                );
                Ok(CycleOutcome::Restarted)
            }
            Err(detail) => {
                error!("Worker restart failed: {}", detail);
                self.record(reason, RestartOutcome::Failure, Some(detail.clone()));
                match self.policy.record_spawn_result(false, Utc::now()) {
                    SpawnOutcome::CooldownEntered { until } => {
                        let failures = self.policy.consecutive_failures();
                        self.record(
                            reason,
                            RestartOutcome::CooldownEntered,
                            Some(format!("restart budget exhausted ({} failures)", failures)),
                        );
                        self.notifier.notify_cooldown(failures, until).await;
                        Ok(CycleOutcome::CooldownEntered)
                    }
                    _ => {
                        self.notifier
                            .maybe_notify(self.policy.consecutive_failures(), &detail)
                            .await;
                        Ok(CycleOutcome::RestartFailed)
                    }
                }
            }
        }
    }

    /// Spawn and wait for the first heartbeat. A worker that never beats
    /// within the startup grace window is stopped and reported as a spawn
    /// failure; the policy treats both identically.
    async fn attempt_spawn(&mut self) -> std::result::Result<(), String> {
        let mut handle = self.spawn_worker().map_err(|e| e.to_string())?;
        debug!("Worker spawned (PID {})", handle.pid);

        if self.await_first_heartbeat(&mut handle).await {
            self.worker = Some(handle);
            Ok(())
        } else {
            let grace = self.config.supervision.startup_grace_secs;
            let detail = format!("no heartbeat within {}s of spawn", grace);
            Self::stop_handle(
                &mut handle,
                Duration::from_secs(self.config.supervision.stop_grace_secs),
            )
            .await;
            Err(detail)
        }
    }

    fn spawn_worker(&self) -> Result<WorkerHandle> {
        let argv = &self.config.worker.command;
        let program = argv
            .first()
            .ok_or_else(|| WardenError::Spawn("empty worker command".to_string()))?;

        let log_path = self.config.worker_log_file();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                WardenError::Spawn(format!("open worker log {}: {}", log_path.display(), e))
            })?;
        let log_err = log
            .try_clone()
            .map_err(|e| WardenError::Spawn(format!("clone worker log handle: {}", e)))?;

        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| WardenError::Spawn(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| WardenError::Spawn("worker exited before its pid was read".to_string()))?;

        Ok(WorkerHandle {
            child,
            pid,
            started_at: Utc::now(),
            exited: false,
        })
    }

    /// True once a heartbeat at or after the spawn instant appears.
    /// Bounded by the startup grace window; an early worker exit ends the
    /// wait immediately.
    async fn await_first_heartbeat(&self, handle: &mut WorkerHandle) -> bool {
        let grace = Duration::from_secs(self.config.supervision.startup_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        // One second of slack for coarse (whole-second) heartbeat encodings
        let threshold = handle.started_at - chrono::Duration::seconds(1);

        loop {
            if let Some(ts) = self.heartbeat.last_beat() {
                if ts >= threshold {
                    return true;
                }
            }
            if let Ok(Some(status)) = handle.child.try_wait() {
                warn!("Worker exited during startup: {}", status);
                handle.exited = true;
                return false;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Graceful-then-forceful worker stop
    async fn stop_worker(&mut self) {
        let Some(mut handle) = self.worker.take() else {
            return;
        };
        let grace = Duration::from_secs(self.config.supervision.stop_grace_secs);
        Self::stop_handle(&mut handle, grace).await;
    }

    async fn stop_handle(handle: &mut WorkerHandle, grace: Duration) {
        handle.reap();
        if handle.exited {
            return;
        }
        info!(
            "Stopping worker PID {} ({}s grace before SIGKILL)",
            handle.pid,
            grace.as_secs()
        );
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(handle.pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = handle.child.start_kill();
        }

        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Worker PID {} exited: {}", handle.pid, status);
            }
            Ok(Err(e)) => {
                warn!("Wait for worker PID {} failed: {}", handle.pid, e);
            }
            Err(_) => {
                warn!(
                    "Worker PID {} ignored SIGTERM for {}s, killing",
                    handle.pid,
                    grace.as_secs()
                );
                if let Err(e) = handle.child.kill().await {
                    error!("Failed to kill worker PID {}: {}", handle.pid, e);
                }
            }
        }
        handle.exited = true;
    }

    /// Ledger failures mid-run are logged, never fatal; the supervisor keeps
    /// supervising even when its history cannot be written
    fn record(&self, reason: RestartReason, outcome: RestartOutcome, error: Option<String>) {
        if let Err(e) = self.ledger.record(reason, outcome, error) {
            error!("Failed to record restart attempt: {}", e);
        }
    }
}

/// Resolves when SIGINT or SIGTERM arrives
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{
        AppConfig, LedgerConfig, LoggingConfig, NetworkConfig, NotifyConfig, PathsConfig,
        RestartConfig, SupervisionConfig, WorkerConfig,
    };

    fn test_config(dir: &tempfile::TempDir, command: Vec<String>) -> AppConfig {
        AppConfig {
            worker: WorkerConfig {
                command,
                log_file: None,
            },
            supervision: SupervisionConfig {
                poll_interval_secs: 1,
                heartbeat_timeout_secs: 5,
                memory_ceiling_mb: 0,
                stop_grace_secs: 2,
                startup_grace_secs: 5,
                auto_takeover: false,
            },
            restart: RestartConfig {
                max_consecutive_failures: 3,
                failure_window_secs: 300,
                cooldown_secs: 1200,
                forced_restart_secs: 0,
            },
            network: NetworkConfig {
                probe_addr: "127.0.0.1:1".to_string(),
                check_every_cycles: 1000,
                connect_timeout_secs: 1,
            },
            notify: NotifyConfig::default(),
            ledger: LedgerConfig { max_entries: 50 },
            paths: PathsConfig {
                run_dir: dir.path().to_path_buf(),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Worker that beats once and then sleeps
    fn beat_once_worker(dir: &tempfile::TempDir) -> Vec<String> {
        let hb = dir.path().join("heartbeat");
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "date +%s > {hb}.tmp && mv {hb}.tmp {hb}; exec sleep 300",
                hb = hb.display()
            ),
        ]
    }

    #[tokio::test]
    async fn start_spawns_worker_and_acquires_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, beat_once_worker(&dir));
        let mut sup = Supervisor::with_sink(config, None).unwrap();

        sup.start().await.unwrap();
        assert!(sup.worker_pid().is_some());
        assert_eq!(sup.policy().state(), SupervisorState::Running);
        assert!(dir.path().join("warden.pid").exists());

        sup.shutdown().await;
        assert!(!dir.path().join("warden.pid").exists());
    }

    #[tokio::test]
    async fn shutdown_is_safe_to_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, beat_once_worker(&dir));
        let mut sup = Supervisor::with_sink(config, None).unwrap();
        sup.start().await.unwrap();

        sup.shutdown().await;
        sup.shutdown().await;
        assert_eq!(sup.policy().state(), SupervisorState::Stopped);
        assert_eq!(sup.tick().await.unwrap(), CycleOutcome::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_counts_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, vec!["/nonexistent/worker".to_string()]);
        let mut sup = Supervisor::with_sink(config, None).unwrap();

        sup.start().await.unwrap();
        assert!(sup.worker_pid().is_none());
        assert_eq!(sup.policy().consecutive_failures(), 1);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn graceful_stop_reaps_sleeping_worker() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, beat_once_worker(&dir));
        let mut sup = Supervisor::with_sink(config, None).unwrap();
        sup.start().await.unwrap();
        let pid = sup.worker_pid().unwrap();

        sup.stop_worker().await;
        assert!(sup.worker_pid().is_none());
        // sh exits on SIGTERM well inside the grace window
        assert!(!crate::supervisor::guard::process_alive(pid));

        sup.shutdown().await;
    }
}
