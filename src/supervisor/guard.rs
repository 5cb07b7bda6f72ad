//! Single-instance guard
//!
//! A pid lock file makes sure only one supervisor (and therefore one worker)
//! runs per host. A lock whose recorded owner is dead is stale and reclaimed
//! automatically; a live owner either blocks acquisition or, with
//! auto-takeover enabled, is terminated once before a single retry.

use crate::error::{Result, WardenError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Exclusive-ownership token recording the supervisor's own pid
#[derive(Debug)]
pub struct LockState {
    pid: u32,
    path: PathBuf,
    released: bool,
}

impl LockState {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lock file if this process still owns it. Idempotent and
    /// safe to call again from shutdown paths.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match read_owner(&self.path) {
            Some(owner) if owner == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!("Failed to remove lock file {}: {}", self.path.display(), e);
                }
            }
            Some(owner) => {
                warn!(
                    "Lock file {} now owned by PID {}, leaving it in place",
                    self.path.display(),
                    owner
                );
            }
            None => {}
        }
    }
}

impl Drop for LockState {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive-lock primitive for the supervisor process
#[derive(Debug, Clone)]
pub struct InstanceGuard {
    path: PathBuf,
    auto_takeover: bool,
    takeover_grace: Duration,
}

impl InstanceGuard {
    pub fn new<P: Into<PathBuf>>(path: P, auto_takeover: bool, takeover_grace: Duration) -> Self {
        Self {
            path: path.into(),
            auto_takeover,
            takeover_grace,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the host-wide lock, non-blocking.
    ///
    /// A stale lock (dead owner) is reclaimed. A live owner fails the
    /// acquisition unless auto-takeover is enabled, in which case the holder
    /// is terminated and the acquisition retried exactly once.
    pub fn acquire(&self) -> Result<LockState> {
        let own_pid = std::process::id();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut takeover_spent = false;
        loop {
            match read_owner(&self.path) {
                Some(owner) if owner == own_pid => break,
                Some(owner) if process_alive(owner) => {
                    if self.auto_takeover && !takeover_spent {
                        takeover_spent = true;
                        warn!("Taking over lock from live supervisor PID {}", owner);
                        self.terminate_holder(owner);
                        continue;
                    }
                    return Err(WardenError::LockHeld { pid: owner });
                }
                Some(owner) => {
                    warn!(
                        "Reclaiming stale lock {} (owner PID {} is gone)",
                        self.path.display(),
                        owner
                    );
                    let _ = fs::remove_file(&self.path);
                    break;
                }
                None => break,
            }
        }

        // Record our own pid so crash-recovery tooling can identify ownership
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", own_pid))
            .map_err(|e| WardenError::Lock(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| WardenError::Lock(format!("rename {}: {}", self.path.display(), e)))?;

        info!("Acquired instance lock {} (PID {})", self.path.display(), own_pid);
        Ok(LockState {
            pid: own_pid,
            path: self.path.clone(),
            released: false,
        })
    }

    /// SIGTERM the holder, wait out the grace window, then SIGKILL
    fn terminate_holder(&self, pid: u32) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let target = Pid::from_raw(pid as i32);
            let _ = kill(target, Signal::SIGTERM);

            let deadline = std::time::Instant::now() + self.takeover_grace;
            while process_alive(pid) && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(200));
            }
            if process_alive(pid) {
                warn!("Previous holder PID {} ignored SIGTERM, killing", pid);
                let _ = kill(target, Signal::SIGKILL);
                std::thread::sleep(Duration::from_millis(200));
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Cannot signal previous holder PID {} on this platform", pid);
        }
    }
}

/// Owning pid recorded in the lock file, if present and parsable
fn read_owner(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse::<u32>().ok()
}

/// kill(pid, 0) probe: does the pid exist at all
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        // No cheap probe on this platform; assume the recorded owner is live
        let _ = pid;
        true
    }
}
