use thiserror::Error;

/// Main error type for the supervisor
#[derive(Error, Debug)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Instance guard errors
    #[error("Another supervisor is running (PID {pid})")]
    LockHeld { pid: u32 },

    #[error("Lock file error: {0}")]
    Lock(String),

    // Worker lifecycle errors
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    // Durable state errors
    #[error("Restart ledger error: {0}")]
    Ledger(String),

    #[error("Heartbeat write failed: {0}")]
    Heartbeat(String),

    // Notification errors
    #[error("Notification failed: {0}")]
    Notify(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
