//! Command-line interface
//!
//! warden run               - Supervise the configured worker
//! warden status            - Show supervisor, heartbeat, and restart history
//! warden stop              - Signal the running supervisor to shut down
//! warden beat              - Write one heartbeat (for shell-scripted workers)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::AppConfig;
use crate::supervisor::guard::process_alive;
use crate::supervisor::heartbeat::{HeartbeatFile, STALE};
use crate::supervisor::ledger::RestartLedger;

/// Worker process supervisor CLI
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about = "Self-healing supervisor for a single worker process")]
pub struct Cli {
    /// Configuration directory (default.toml, <env>.toml)
    #[arg(short, long, default_value = "config", env = "WARDEN_CONFIG_DIR")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise the configured worker until a shutdown signal
    Run,

    /// Show supervisor status, heartbeat age, and recent restarts
    Status {
        /// Number of ledger entries to show
        #[arg(short = 'n', long, default_value = "10")]
        tail: usize,
    },

    /// Stop the running supervisor
    Stop {
        /// Force stop (SIGKILL instead of SIGTERM)
        #[arg(long)]
        force: bool,
    },

    /// Write a single heartbeat on behalf of the worker
    Beat,
}

/// Show lock, heartbeat, and ledger state
pub async fn show_status(config: &AppConfig, tail: usize) -> Result<()> {
    println!("\n{}", "=".repeat(60));
    println!("  WARDEN STATUS");
    println!("{}\n", "=".repeat(60));

    let lock_file = config.paths.lock_file();
    match read_pid(&lock_file) {
        Some(pid) if process_alive(pid) => {
            println!("  supervisor   \x1b[32m● running\x1b[0m (PID {})", pid);
        }
        Some(pid) => {
            println!("  supervisor   \x1b[31m✗ stale lock\x1b[0m (dead PID {})", pid);
        }
        None => {
            println!("  supervisor   \x1b[90m○ not running\x1b[0m");
        }
    }

    let heartbeat = HeartbeatFile::new(config.paths.heartbeat_file());
    let age = heartbeat.age();
    if age == STALE {
        println!("  heartbeat    \x1b[90mnever seen\x1b[0m");
    } else if age > Duration::from_secs(config.supervision.heartbeat_timeout_secs) {
        println!("  heartbeat    \x1b[31m{}s ago (stale)\x1b[0m", age.as_secs());
    } else {
        println!("  heartbeat    \x1b[32m{}s ago\x1b[0m", age.as_secs());
    }

    let ledger = RestartLedger::new(config.paths.ledger_file(), config.ledger.max_entries);
    let entries = ledger.load().context("Failed to read restart ledger")?;
    println!("\n  Recent restarts ({} total on file):", entries.len());
    println!("  {}", "-".repeat(55));
    if entries.is_empty() {
        println!("  \x1b[90m(none recorded)\x1b[0m");
    }
    for entry in entries.iter().rev().take(tail) {
        println!(
            "  #{:<5} {}  {:<16} {:?}{}",
            entry.sequence,
            format_time(entry.timestamp),
            entry.reason.to_string(),
            entry.outcome,
            entry
                .error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    println!("\n{}", "=".repeat(60));

    Ok(())
}

/// Signal the running supervisor via the lock file
pub async fn stop_supervisor(config: &AppConfig, force: bool) -> Result<()> {
    let lock_file = config.paths.lock_file();
    let Some(pid) = read_pid(&lock_file) else {
        println!("\x1b[33m⚠ Supervisor is not running\x1b[0m");
        return Ok(());
    };

    if !process_alive(pid) {
        println!("\x1b[33m⚠ Supervisor PID {} is gone, cleaning stale lock\x1b[0m", pid);
        let _ = fs::remove_file(&lock_file);
        return Ok(());
    }

    let signal = if force { "SIGKILL" } else { "SIGTERM" };
    println!("Stopping supervisor (PID {}) with {}...", pid, signal);

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(_) => println!("\x1b[32m✓ Stop signal sent\x1b[0m"),
            Err(e) => println!("\x1b[31m✗ Failed to signal supervisor: {}\x1b[0m", e),
        }
    }

    #[cfg(not(unix))]
    {
        println!("\x1b[33m⚠ Signal handling not supported on this platform\x1b[0m");
        println!("  Manually kill process with PID: {}", pid);
    }

    Ok(())
}

/// Write one heartbeat, for workers driven by shell scripts
pub async fn write_beat(config: &AppConfig) -> Result<()> {
    let heartbeat = HeartbeatFile::new(config.paths.heartbeat_file());
    heartbeat.beat().context("Failed to write heartbeat")?;
    Ok(())
}

fn read_pid(path: &std::path::Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
