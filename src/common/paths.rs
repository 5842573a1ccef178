//! Locations of the state shared by every execution context.

use std::path::{Path, PathBuf};

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "MSG_MIRROR_HOME";

const APP_DIR: &str = "msg-mirror";

/// Resolve the state directory: explicit override first, then the platform
/// data directory, then `/tmp`
pub fn state_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

/// All paths derived from one state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one file per configuration field
    pub fn prefs_dir(&self) -> PathBuf {
        self.root.join("prefs")
    }

    /// Diagnostic log file
    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs.txt")
    }

    /// Socket the headless context listens on
    pub fn socket(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    /// PID file claimed by the promoted headless process
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }
}
