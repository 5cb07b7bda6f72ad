//! File-backed heartbeat channel
//!
//! The worker overwrites a single timestamp at a fixed cadence; the supervisor
//! reads it to detect hangs. Writes go through a temp-file rename so a reader
//! never observes a partial timestamp, and any unreadable state degrades to
//! "infinitely stale" rather than an error.

use crate::error::{Result, WardenError};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Sentinel age for a heartbeat that has never been written or cannot be read
pub const STALE: Duration = Duration::MAX;

/// Single-writer, single-reader liveness signal shared across processes
#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    path: PathBuf,
}

impl HeartbeatFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current time. Called by the worker on a fixed cadence.
    pub fn beat(&self) -> Result<()> {
        self.beat_at(Utc::now())
    }

    /// Record an explicit timestamp (epoch seconds, atomically replaced)
    pub fn beat_at(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", now.timestamp()))
            .map_err(|e| WardenError::Heartbeat(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| WardenError::Heartbeat(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    /// Timestamp of the last successful beat, if one is readable
    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        parse_timestamp(raw.trim())
    }

    /// Elapsed time since the last beat. Missing or corrupt content is
    /// reported as [`STALE`], never as fresh and never as an error.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// Age relative to an explicit clock reading
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        match self.last_beat() {
            Some(ts) => {
                let secs = now.signed_duration_since(ts).num_seconds();
                // A beat from the future means clock skew, not a hang
                Duration::from_secs(secs.max(0) as u64)
            }
            None => {
                debug!("heartbeat at {} missing or unparsable", self.path.display());
                STALE
            }
        }
    }
}

/// Accepts epoch seconds or an ISO-8601 / RFC 3339 string
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        return DateTime::from_timestamp(epoch, 0);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
