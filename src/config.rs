use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Empty command is tolerated at load time so status/stop/beat work
    /// without a worker configured; `validate()` gates the run path
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WorkerConfig {
    /// Executable path plus arguments used to spawn and restart the worker
    #[serde(default)]
    pub command: Vec<String>,
    /// File capturing worker stdout/stderr (default: <run_dir>/worker.log)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisionConfig {
    /// Seconds between poll-evaluate-decide-act cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Heartbeat age beyond which the worker counts as hung
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Resident memory ceiling in MB (0 = disabled)
    #[serde(default)]
    pub memory_ceiling_mb: u64,
    /// Grace window between SIGTERM and SIGKILL when stopping the worker
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Window after spawn in which the first heartbeat must appear
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
    /// Terminate a live previous lock holder instead of failing startup
    #[serde(default)]
    pub auto_takeover: bool,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    45
}

fn default_stop_grace() -> u64 {
    10
}

fn default_startup_grace() -> u64 {
    30
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            memory_ceiling_mb: 0,
            stop_grace_secs: default_stop_grace(),
            startup_grace_secs: default_startup_grace(),
            auto_takeover: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    /// Consecutive failed restarts before entering cooldown
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Rolling window for counting consecutive failures
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
    /// Cooldown duration once the restart budget is exhausted
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Preventive restart once uptime exceeds this (0 = disabled)
    #[serde(default)]
    pub forced_restart_secs: u64,
}

fn default_max_failures() -> u32 {
    3
}

fn default_failure_window() -> u64 {
    300
}

fn default_cooldown() -> u64 {
    1200
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_failures(),
            failure_window_secs: default_failure_window(),
            cooldown_secs: default_cooldown(),
            forced_restart_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// host:port probed for outbound reachability
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    /// Probe every Nth poll cycle
    #[serde(default = "default_check_every")]
    pub check_every_cycles: u64,
    /// Probe connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_probe_addr() -> String {
    "1.1.1.1:443".to_string()
}

fn default_check_every() -> u64 {
    6
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_addr: default_probe_addr(),
            check_every_cycles: default_check_every(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Webhook URL for operator alerts (unset = notifications disabled)
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Consecutive failures before the incident alert fires
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Maximum retained restart attempts (oldest evicted first)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    200
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the heartbeat, lock, and ledger files
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

fn default_run_dir() -> PathBuf {
    std::env::var("WARDEN_RUN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::state_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("warden")
        })
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
        }
    }
}

impl PathsConfig {
    pub fn heartbeat_file(&self) -> PathBuf {
        self.run_dir.join("heartbeat")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.run_dir.join("warden.pid")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.run_dir.join("restarts.json")
    }

    pub fn worker_log_file(&self) -> PathBuf {
        self.run_dir.join("worker.log")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Write supervisor logs to daily-rotated files in this directory
    /// instead of stdout
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("supervision.poll_interval_secs", default_poll_interval())?
            .set_default("restart.cooldown_secs", default_cooldown())?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (WARDEN_WORKER__COMMAND, etc.)
            .add_source(
                Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Reject configurations the supervisor cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.is_empty() {
            return Err(ConfigError::Message(
                "worker.command must name an executable".to_string(),
            ));
        }
        if self.supervision.poll_interval_secs == 0 {
            return Err(ConfigError::Message(
                "supervision.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.supervision.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "supervision.heartbeat_timeout_secs must be positive".to_string(),
            ));
        }
        if self.restart.max_consecutive_failures == 0 {
            return Err(ConfigError::Message(
                "restart.max_consecutive_failures must be positive".to_string(),
            ));
        }
        if self.network.check_every_cycles == 0 {
            return Err(ConfigError::Message(
                "network.check_every_cycles must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker output capture path, defaulting into the run directory
    pub fn worker_log_file(&self) -> PathBuf {
        self.worker
            .log_file
            .clone()
            .unwrap_or_else(|| self.paths.worker_log_file())
    }
}
