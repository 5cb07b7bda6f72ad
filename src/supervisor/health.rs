//! Health evaluation
//!
//! Combines process liveness, heartbeat staleness, resident memory, network
//! reachability, and preventive-restart age into one immutable verdict per
//! poll. Evaluation only reads; acting on the verdict is the policy's job.

use crate::config::{NetworkConfig, RestartConfig};
use crate::supervisor::heartbeat::HeartbeatFile;
use chrono::{DateTime, Utc};
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessStatus, System};
use tracing::{debug, warn};

/// Minimal view of the supervised process the evaluator needs
#[derive(Debug, Clone, Copy)]
pub struct WorkerView {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time health snapshot, produced fresh on every poll
#[derive(Debug, Clone)]
pub struct HealthVerdict {
    /// Worker pid present and not a zombie
    pub process_alive: bool,
    /// Elapsed time since the last heartbeat ([`Duration::MAX`] = never seen)
    pub heartbeat_age: Duration,
    /// Resident memory of the worker, when the process table has it
    pub memory_bytes: Option<u64>,
    /// Outbound connectivity at the last sampled probe
    pub network_ok: bool,
    /// Uptime exceeded the forced-restart interval (preventive, not a failure)
    pub forced_restart_due: bool,
}

impl HealthVerdict {
    pub fn heartbeat_stale(&self, timeout: Duration) -> bool {
        self.heartbeat_age > timeout
    }

    pub fn memory_exceeded(&self, ceiling_bytes: u64) -> bool {
        ceiling_bytes > 0 && self.memory_bytes.is_some_and(|used| used > ceiling_bytes)
    }
}

/// Samples all health signals for the supervisor loop
pub struct HealthEvaluator {
    restart: RestartConfig,
    network: NetworkConfig,
    heartbeat: HeartbeatFile,
    system: System,
    cycles: u64,
    last_network_ok: bool,
}

impl HealthEvaluator {
    pub fn new(restart: RestartConfig, network: NetworkConfig, heartbeat: HeartbeatFile) -> Self {
        Self {
            restart,
            network,
            heartbeat,
            system: System::new(),
            cycles: 0,
            // Optimistic until the first probe lands
            last_network_ok: true,
        }
    }

    /// Produce a fresh verdict for the current poll cycle
    pub async fn evaluate(&mut self, worker: Option<WorkerView>) -> HealthVerdict {
        self.cycles += 1;

        let (process_alive, memory_bytes) = match worker {
            Some(view) => self.sample_process(view.pid),
            None => (false, None),
        };

        let heartbeat_age = self.heartbeat.age();

        if self.cycles % self.network.check_every_cycles == 1 || self.network.check_every_cycles == 1
        {
            self.last_network_ok = self.probe_network().await;
        }

        let forced_restart_due = match worker {
            Some(view) if self.restart.forced_restart_secs > 0 => {
                let uptime = Utc::now().signed_duration_since(view.started_at);
                uptime.num_seconds() >= self.restart.forced_restart_secs as i64
            }
            _ => false,
        };

        let verdict = HealthVerdict {
            process_alive,
            heartbeat_age,
            memory_bytes,
            network_ok: self.last_network_ok,
            forced_restart_due,
        };
        debug!(
            alive = verdict.process_alive,
            heartbeat_secs = heartbeat_age_secs(&verdict),
            memory_bytes = verdict.memory_bytes,
            network_ok = verdict.network_ok,
            forced_due = verdict.forced_restart_due,
            "health sampled"
        );
        verdict
    }

    /// One process-table refresh yields both liveness and resident memory.
    /// A zombie has already exited for supervision purposes.
    fn sample_process(&mut self, pid: u32) -> (bool, Option<u64>) {
        let sys_pid = SysPid::from_u32(pid);
        if !self.system.refresh_process(sys_pid) {
            return (false, None);
        }
        match self.system.process(sys_pid) {
            Some(proc_) if proc_.status() == ProcessStatus::Zombie => (false, None),
            Some(proc_) => (true, Some(proc_.memory())),
            None => (false, None),
        }
    }

    /// Bounded TCP connect to the configured endpoint
    async fn probe_network(&self) -> bool {
        let timeout = Duration::from_secs(self.network.connect_timeout_secs);
        match tokio::time::timeout(
            timeout,
            tokio::net::TcpStream::connect(&self.network.probe_addr),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Network probe to {} failed: {}", self.network.probe_addr, e);
                false
            }
            Err(_) => {
                warn!(
                    "Network probe to {} timed out after {:?}",
                    self.network.probe_addr, timeout
                );
                false
            }
        }
    }
}

fn heartbeat_age_secs(verdict: &HealthVerdict) -> i64 {
    if verdict.heartbeat_age == Duration::MAX {
        -1
    } else {
        verdict.heartbeat_age.as_secs() as i64
    }
}
