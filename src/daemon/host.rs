//! Promotion of the headless process to a persistent, single-instance state.

use std::fs;
use std::path::{Path, PathBuf};

use sysinfo::{Pid, System};

use crate::common::error::StartupFailure;
use crate::common::store::write_atomic;

/// What the host shows while the process is promoted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundNotice {
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
}

impl Default for ForegroundNotice {
    fn default() -> Self {
        Self {
            channel_id: "message_mirror".to_string(),
            channel_name: "Message Mirror".to_string(),
            title: "Message Mirror running".to_string(),
        }
    }
}

/// Host primitive that keeps the process alive
pub trait Host: Send + Sync {
    /// Ask the host to make this process persistent. May be refused.
    fn promote(&self, notice: &ForegroundNotice) -> Result<(), StartupFailure>;

    /// Whether the promotion is currently in effect
    fn is_promoted(&self) -> bool;

    /// Give the promotion back. Safe to call when not promoted.
    fn release(&self);
}

/// Promotion by claiming a PID file; a live process already holding it
/// rejects the claim
#[derive(Debug, Clone)]
pub struct PidFileHost {
    path: PathBuf,
    pid: u32,
}

impl PidFileHost {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pid: std::process::id(),
        }
    }

    #[cfg(test)]
    fn with_pid(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Host for PidFileHost {
    fn promote(&self, notice: &ForegroundNotice) -> Result<(), StartupFailure> {
        if let Some(holder) = read_pid(&self.path) {
            if holder != self.pid && is_process_alive(holder) {
                return Err(StartupFailure::AlreadyClaimed { pid: holder });
            }
        }
        write_atomic(&self.path, self.pid.to_string().as_bytes())
            .map_err(|e| StartupFailure::Rejected(e.to_string()))?;
        tracing::info!(
            channel = %notice.channel_id,
            pid = self.pid,
            "{}",
            notice.title
        );
        Ok(())
    }

    fn is_promoted(&self) -> bool {
        read_pid(&self.path) == Some(self.pid)
    }

    fn release(&self) {
        if read_pid(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// PID recorded in `path`, if the file holds one
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check whether a process with `pid` exists
pub fn is_process_alive(pid: u32) -> bool {
    let sys = System::new_all();
    sys.process(Pid::from_u32(pid)).is_some()
}
