pub mod cli;
pub mod config;
pub mod error;
pub mod retry;
pub mod supervisor;

pub use config::AppConfig;
pub use error::{Result, WardenError};
pub use retry::{retry_with_backoff, RateLimiter, RetryClass, RetryConfig, Retryable};
pub use supervisor::{
    CycleOutcome, HealthEvaluator, HealthVerdict, HeartbeatFile, IncidentNotifier, InstanceGuard,
    LockState, PolicyAction, RestartAttempt, RestartLedger, RestartOutcome, RestartPolicy,
    RestartReason, Supervisor, SupervisorState, WebhookNotifier,
};
