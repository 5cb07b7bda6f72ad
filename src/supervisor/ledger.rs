//! Durable restart ledger
//!
//! Append-capped history of restart attempts, serialized as a JSON array so
//! external status viewers can read it directly. Every write rewrites the
//! file through a temp-file rename; a torn read is structurally impossible.

use crate::error::{Result, WardenError};
use crate::supervisor::policy::RestartReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How a restart attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    Success,
    Failure,
    /// Budget exhausted; recorded once when the policy enters cooldown
    CooldownEntered,
}

/// One entry in the restart history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartAttempt {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub reason: RestartReason,
    pub outcome: RestartOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Capped, file-backed list of restart attempts
pub struct RestartLedger {
    path: PathBuf,
    max_entries: usize,
}

impl RestartLedger {
    pub fn new<P: Into<PathBuf>>(path: P, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an attempt, evicting the oldest entries beyond the cap
    pub fn record(
        &self,
        reason: RestartReason,
        outcome: RestartOutcome,
        error: Option<String>,
    ) -> Result<RestartAttempt> {
        let mut entries = self.load()?;
        let sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        let attempt = RestartAttempt {
            timestamp: Utc::now(),
            sequence,
            reason,
            outcome,
            error,
        };
        entries.push(attempt.clone());
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        self.save(&entries)?;
        debug!(
            sequence,
            reason = %reason,
            outcome = ?outcome,
            "restart attempt recorded"
        );
        Ok(attempt)
    }

    /// All retained attempts, oldest first. Missing file means empty history.
    pub fn load(&self) -> Result<Vec<RestartAttempt>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| WardenError::Ledger(format!("parse {}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(WardenError::Ledger(format!(
                "read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Verify the ledger location is writable; supervisor startup fails fast
    /// on an unusable ledger rather than discovering it mid-incident
    pub fn ensure_writable(&self) -> Result<()> {
        let entries = self.load()?;
        self.save(&entries)
    }

    fn save(&self, entries: &[RestartAttempt]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp, raw)
            .map_err(|e| WardenError::Ledger(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| WardenError::Ledger(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}
