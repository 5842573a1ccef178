//! Append-only, bounded diagnostic log shared by every execution context.
//!
//! Best-effort throughout: no operation here ever returns an error. Storage
//! failures are dropped after a `tracing` warning.
//!
//! The daemon and the CLI write the same file. Every append (with its
//! compaction) and every clear runs under an advisory lock on a sibling
//! `.lock` file, so one process never rewrites the log over another's line.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::store::write_atomic;

/// Entries kept before the oldest are evicted
pub const DEFAULT_RETENTION: usize = 500;

/// One timestamped line of the diagnostic log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let (ts, message) = line.split_once('\t')?;
        let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        Some(Self {
            timestamp,
            message: message.to_string(),
        })
    }
}

/// Handle to the log file. Clones share the same in-process lock.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    path: PathBuf,
    retention: usize,
    lock: Arc<Mutex<()>>,
}

impl DiagnosticLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_retention(path, DEFAULT_RETENTION)
    }

    pub fn with_retention(path: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            path: path.into(),
            retention: retention.max(1),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped entry, evicting the oldest past the bound
    pub fn append(&self, message: impl AsRef<str>) {
        let message = flatten(message.as_ref());
        tracing::debug!(target: "msg_mirror::diagnostics", "{}", message);

        let entry = LogEntry {
            timestamp: Utc::now(),
            message,
        };

        let _guard = self.lock.lock();
        let _file_lock = self.lock_across_processes();
        if let Err(e) = self.append_line(&entry.to_line()) {
            tracing::warn!(path = %self.path.display(), error = %e, "diagnostic log append failed");
            return;
        }
        self.compact();
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Exclusive advisory lock, released when the handle drops. Without it we
    /// still write, just unguarded against other processes.
    fn lock_across_processes(&self) -> Option<fs::File> {
        let acquire = || -> std::io::Result<fs::File> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.lock_path())?;
            file.lock_exclusive()?;
            Ok(file)
        };
        match acquire() {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "diagnostic log lock unavailable");
                None
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    fn compact(&self) {
        let lines = self.read_lines();
        if lines.len() <= self.retention {
            return;
        }
        let keep = &lines[lines.len() - self.retention..];
        let mut content = keep.join("\n");
        content.push('\n');
        if let Err(e) = write_atomic(&self.path, content.as_bytes()) {
            tracing::warn!(error = %e, "diagnostic log compaction failed");
        }
    }

    fn read_lines(&self) -> Vec<String> {
        let Ok(file) = fs::File::open(&self.path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .collect()
    }

    /// All retained entries, oldest first
    pub fn read(&self) -> Vec<LogEntry> {
        let entries: Vec<LogEntry> = self
            .read_lines()
            .iter()
            .filter_map(|line| LogEntry::parse(line))
            .collect();
        let skip = entries.len().saturating_sub(self.retention);
        entries.into_iter().skip(skip).collect()
    }

    /// Drop every entry
    pub fn clear(&self) {
        let _guard = self.lock.lock();
        let _file_lock = self.lock_across_processes();
        if let Err(e) = write_atomic(&self.path, b"") {
            tracing::warn!(error = %e, "diagnostic log clear failed");
        }
    }
}

/// Keep one entry per line
fn flatten(message: &str) -> String {
    message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}
