//! End-to-end supervision scenarios against real spawned workers
#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use warden::config::{
    AppConfig, LedgerConfig, LoggingConfig, NetworkConfig, NotifyConfig, PathsConfig,
    RestartConfig, SupervisionConfig, WorkerConfig,
};
use warden::supervisor::{
    AlertSink, CycleOutcome, RestartOutcome, RestartReason, Supervisor, SupervisorState,
};
use warden::WardenError;

fn config_for(dir: &TempDir, command: Vec<String>) -> AppConfig {
    AppConfig {
        worker: WorkerConfig {
            command,
            log_file: None,
        },
        supervision: SupervisionConfig {
            poll_interval_secs: 1,
            heartbeat_timeout_secs: 10,
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
            // Loop-back refusal keeps probes instant and off the wire
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

/// Worker that refreshes the heartbeat every second
fn heartbeat_loop_worker(dir: &TempDir) -> Vec<String> {
    let hb = dir.path().join("heartbeat");
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "while true; do date +%s > {hb}.tmp && mv {hb}.tmp {hb}; sleep 1; done",
            hb = hb.display()
        ),
    ]
}

/// Worker that beats once and then hangs
fn beat_once_worker(dir: &TempDir) -> Vec<String> {
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

fn sigkill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, text: &str) -> Result<(), String> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Worker crash -> unhealthy on next poll -> restart -> back to
/// running with exactly one success entry in the ledger
#[tokio::test]
async fn crashed_worker_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, heartbeat_loop_worker(&dir));
    let mut sup = Supervisor::with_sink(config, None).unwrap();

    sup.start().await.unwrap();
    let first_pid = sup.worker_pid().expect("worker spawned");
    assert_eq!(sup.policy().state(), SupervisorState::Running);

    sigkill(first_pid);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = sup.tick().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Restarted);
    assert_eq!(sup.policy().state(), SupervisorState::Running);
    let second_pid = sup.worker_pid().expect("worker respawned");
    assert_ne!(second_pid, first_pid);

    let entries = sup.ledger().load().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, RestartReason::ProcessExit);
    assert_eq!(entries[0].outcome, RestartOutcome::Success);

    sup.shutdown().await;
}

/// Heartbeat stops while the process stays alive -> staleness
/// alone triggers a graceful-then-forceful replacement
#[tokio::test]
async fn hung_worker_is_replaced_on_stale_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&dir, beat_once_worker(&dir));
    config.supervision.heartbeat_timeout_secs = 2;
    let mut sup = Supervisor::with_sink(config, None).unwrap();

    sup.start().await.unwrap();
    let first_pid = sup.worker_pid().expect("worker spawned");

    // Heartbeat was written once at startup; let it go stale
    tokio::time::sleep(Duration::from_secs(3)).await;

    let outcome = sup.tick().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Restarted);
    let second_pid = sup.worker_pid().expect("worker respawned");
    assert_ne!(second_pid, first_pid);

    let entries = sup.ledger().load().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, RestartReason::HeartbeatStale);
    assert_eq!(entries[0].outcome, RestartOutcome::Success);

    sup.shutdown().await;
}

/// Three consecutive spawn failures exhaust the budget; further
/// unhealthy verdicts during cooldown spawn nothing and record nothing
#[tokio::test]
async fn spawn_failures_enter_cooldown_and_stay_idle() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, vec!["/nonexistent/worker".to_string()]);
    let sink = RecordingSink::new();
    let mut sup = Supervisor::with_sink(config, Some(sink.clone())).unwrap();

    // Initial spawn fails: failure 1, not a restart so not in the ledger
    sup.start().await.unwrap();
    assert_eq!(sup.policy().consecutive_failures(), 1);

    // Failure 2
    assert_eq!(sup.tick().await.unwrap(), CycleOutcome::RestartFailed);
    // Failure 3 exhausts the budget
    assert_eq!(sup.tick().await.unwrap(), CycleOutcome::CooldownEntered);
    assert_eq!(sup.policy().state(), SupervisorState::Cooldown);

    let entries = sup.ledger().load().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].outcome, RestartOutcome::Failure);
    assert_eq!(entries[1].outcome, RestartOutcome::Failure);
    assert_eq!(entries[2].outcome, RestartOutcome::CooldownEntered);

    // Fourth unhealthy verdict: no spawn attempt, no new ledger entries
    assert_eq!(sup.tick().await.unwrap(), CycleOutcome::CoolingDown);
    assert!(sup.worker_pid().is_none());
    assert_eq!(sup.ledger().load().unwrap().len(), 3);

    // Exactly one operator alert for the whole incident
    assert_eq!(sink.count(), 1);

    sup.shutdown().await;
}

/// Preventive restart of a healthy worker, reason "scheduled",
/// failure counter untouched
#[tokio::test]
async fn forced_periodic_restart_is_scheduled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&dir, heartbeat_loop_worker(&dir));
    config.restart.forced_restart_secs = 1;
    let mut sup = Supervisor::with_sink(config, None).unwrap();

    sup.start().await.unwrap();
    let first_pid = sup.worker_pid().expect("worker spawned");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let outcome = sup.tick().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Restarted);
    assert_ne!(sup.worker_pid().unwrap(), first_pid);
    assert_eq!(sup.policy().consecutive_failures(), 0);

    let entries = sup.ledger().load().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, RestartReason::Scheduled);
    assert_eq!(entries[0].outcome, RestartOutcome::Success);

    sup.shutdown().await;
}

/// A live lock holder blocks supervisor startup outright
#[tokio::test]
async fn supervisor_refuses_start_while_lock_held() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, beat_once_worker(&dir));

    let mut holder = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn lock holder");
    std::fs::write(
        dir.path().join("warden.pid"),
        format!("{}\n", holder.id()),
    )
    .unwrap();

    let mut sup = Supervisor::with_sink(config, None).unwrap();
    match sup.start().await {
        Err(WardenError::LockHeld { pid }) => assert_eq!(pid, holder.id()),
        other => panic!("expected LockHeld, got {:?}", other.err()),
    }

    let _ = holder.kill();
    let _ = holder.wait();
}

/// A lock whose owner is dead is reclaimed without manual intervention
#[tokio::test]
async fn supervisor_reclaims_stale_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, beat_once_worker(&dir));

    let mut gone = std::process::Command::new("true")
        .spawn()
        .expect("spawn short-lived process");
    let dead_pid = gone.id();
    let _ = gone.wait();
    std::fs::write(dir.path().join("warden.pid"), format!("{}\n", dead_pid)).unwrap();

    let mut sup = Supervisor::with_sink(config, None).unwrap();
    sup.start().await.unwrap();
    assert_eq!(sup.policy().state(), SupervisorState::Running);

    let recorded = std::fs::read_to_string(dir.path().join("warden.pid")).unwrap();
    assert_eq!(recorded.trim(), std::process::id().to_string());

    sup.shutdown().await;
}
