//! Process supervision
//!
//! This module keeps one worker process alive on one host:
//! - Instance guard so only a single supervisor/worker pair can run
//! - File-backed heartbeat channel between worker and supervisor
//! - Health evaluator combining liveness, staleness, memory, and network
//! - Restart policy with failure budget and cooldown
//! - Durable restart ledger and once-per-incident operator alerts
//! - The supervisor loop owning the worker's process lifecycle

pub mod guard;
pub mod health;
pub mod heartbeat;
pub mod ledger;
pub mod notifier;
pub mod policy;
pub mod runner;

pub use guard::{InstanceGuard, LockState};
pub use health::{HealthEvaluator, HealthVerdict, WorkerView};
pub use heartbeat::{HeartbeatFile, STALE};
pub use ledger::{RestartAttempt, RestartLedger, RestartOutcome};
pub use notifier::{AlertSink, IncidentNotifier, WebhookNotifier};
pub use policy::{PolicyAction, RestartPolicy, RestartReason, SupervisorState};
pub use runner::{CycleOutcome, Supervisor, WorkerHandle};
