//! IPC message types between the interactive CLI and the headless daemon.
//!
//! Newline-delimited JSON over the daemon's Unix socket.

use serde::{Deserialize, Serialize};

use crate::common::diagnostics::LogEntry;
use crate::common::types::CapturedEvent;

/// Commands sent from the CLI (or a capture adapter) to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonCommand {
    /// Health check
    Ping,
    /// Request daemon status
    Status,
    /// Start command for an already spawned daemon; starts it if stopped
    Start,
    /// Hand a captured event to the daemon's capture host
    Capture(CapturedEvent),
    /// Broadcast the retry signal to every endpoint in the daemon
    ForceRetry,
    /// Persisted SMS setting changed; re-apply it
    SetSmsEnabled(bool),
    /// Stream delivered events and signals on this connection
    Subscribe,
    /// Read the diagnostic log
    ReadLogs,
    /// Graceful shutdown
    Shutdown,
}

/// Responses and stream items from the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Pong response for health check
    Pong,
    /// Operation completed successfully
    Ok,
    /// Error response
    Error { message: String },
    /// Daemon status info
    Status {
        state: String,
        sms_observer: bool,
        notification_observer: bool,
        pending_events: usize,
        subscriber_count: usize,
        uptime_secs: u64,
    },
    /// Current state of the SMS subscription after a toggle
    SmsObserver { enabled: bool },
    /// An event delivered to the headless endpoint (sent to subscribers)
    Delivered { event: CapturedEvent },
    /// A control signal received by the headless endpoint (sent to subscribers)
    Signal { name: String },
    /// Diagnostic log contents
    Logs { entries: Vec<LogEntry> },
}
