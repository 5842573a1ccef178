//! Client side of the daemon socket, used by the interactive context.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::common::diagnostics::{DiagnosticLog, LogEntry};
use crate::common::paths::StatePaths;
use crate::common::store::DurableStore;
use crate::common::types::{CapturedEvent, Permission, Role, FORCE_RETRY};
use crate::daemon::control::Control;
use crate::ipc::messages::{DaemonCommand, DaemonResponse};
use crate::relay::{Dispatch, Endpoint, EventChannelRouter};

/// How long a request waits for its response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `start` waits for a freshly spawned daemon to answer
const SPAWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Shown to the user once after a failed start
pub const START_FAILED_NOTICE: &str =
    "Couldn't start monitoring service. Please check permissions or update the app.";

/// Client for communicating with the daemon
pub struct DaemonClient {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
}

impl DaemonClient {
    /// Create a new daemon client
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: None,
        }
    }

    /// Check if connected to daemon
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Try to connect to the daemon
    pub fn connect(&mut self) -> bool {
        if !self.socket_path.exists() {
            self.stream = None;
            return false;
        }

        match UnixStream::connect(&self.socket_path) {
            Ok(stream) => {
                let _ = stream.set_read_timeout(Some(RESPONSE_TIMEOUT));
                let _ = stream.set_write_timeout(Some(Duration::from_millis(1000)));
                self.stream = Some(stream);
                true
            }
            Err(_) => {
                self.stream = None;
                false
            }
        }
    }

    /// Send a command and receive a response, connecting first if needed
    pub fn send_command(&mut self, command: DaemonCommand) -> Option<DaemonResponse> {
        if self.stream.is_none() && !self.connect() {
            return None;
        }
        let stream = self.stream.as_mut()?;

        let json = serde_json::to_string(&command).ok()?;
        writeln!(stream, "{}", json).ok()?;
        stream.flush().ok()?;

        let mut reader = BufReader::new(stream.try_clone().ok()?);
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;

        serde_json::from_str(&line).ok()
    }

    /// Ping daemon for health check
    pub fn ping(&mut self) -> bool {
        matches!(self.send_command(DaemonCommand::Ping), Some(DaemonResponse::Pong))
    }

    /// Check daemon status
    pub fn status(&mut self) -> Option<DaemonStatus> {
        match self.send_command(DaemonCommand::Status)? {
            DaemonResponse::Status {
                state,
                sms_observer,
                notification_observer,
                pending_events,
                subscriber_count,
                uptime_secs,
            } => Some(DaemonStatus {
                state,
                sms_observer,
                notification_observer,
                pending_events,
                subscriber_count,
                uptime_secs,
            }),
            _ => None,
        }
    }

    /// Deliver the start command to a running daemon
    pub fn start(&mut self) -> Result<()> {
        self.expect_ok(DaemonCommand::Start)
    }

    /// Hand a captured event to the daemon
    pub fn capture(&mut self, event: CapturedEvent) -> Result<()> {
        self.expect_ok(DaemonCommand::Capture(event))
    }

    fn expect_ok(&mut self, command: DaemonCommand) -> Result<()> {
        match self.send_command(command) {
            Some(DaemonResponse::Ok) => Ok(()),
            Some(DaemonResponse::Error { message }) => bail!(message),
            Some(other) => bail!("Unexpected response: {:?}", other),
            None => bail!("Daemon not reachable"),
        }
    }

    /// Ask the daemon to broadcast the retry signal
    pub fn force_retry(&mut self) -> bool {
        matches!(self.send_command(DaemonCommand::ForceRetry), Some(DaemonResponse::Ok))
    }

    /// Re-apply the SMS setting; returns whether the subscription is now active
    pub fn set_sms_enabled(&mut self, enabled: bool) -> Option<bool> {
        match self.send_command(DaemonCommand::SetSmsEnabled(enabled))? {
            DaemonResponse::SmsObserver { enabled } => Some(enabled),
            _ => None,
        }
    }

    pub fn read_logs(&mut self) -> Option<Vec<LogEntry>> {
        match self.send_command(DaemonCommand::ReadLogs)? {
            DaemonResponse::Logs { entries } => Some(entries),
            _ => None,
        }
    }

    /// Request graceful shutdown
    pub fn shutdown(&mut self) -> bool {
        matches!(self.send_command(DaemonCommand::Shutdown), Some(DaemonResponse::Ok))
    }

    /// Turn this connection into a stream of delivered events and signals
    pub fn subscribe(mut self) -> Option<Subscription> {
        if self.stream.is_none() && !self.connect() {
            return None;
        }
        let mut stream = self.stream.take()?;
        let json = serde_json::to_string(&DaemonCommand::Subscribe).ok()?;
        writeln!(stream, "{}", json).ok()?;
        stream.flush().ok()?;

        // Keep one reader for the acknowledgement and the stream so nothing
        // buffered after the ack is lost
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        match serde_json::from_str(&line).ok()? {
            DaemonResponse::Ok => {}
            _ => return None,
        }
        reader.get_ref().set_read_timeout(None).ok()?;
        Some(Subscription { reader })
    }
}

/// Blocking iterator over what the daemon publishes to subscribers
pub struct Subscription {
    reader: BufReader<UnixStream>,
}

impl Iterator for Subscription {
    type Item = DaemonResponse;

    fn next(&mut self) -> Option<DaemonResponse> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).ok()? == 0 {
                return None;
            }
            match serde_json::from_str(&line) {
                Ok(message) => return Some(message),
                Err(e) => tracing::debug!(error = %e, "skipping malformed stream line"),
            }
        }
    }
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub state: String,
    pub sms_observer: bool,
    pub notification_observer: bool,
    pub pending_events: usize,
    pub subscriber_count: usize,
    pub uptime_secs: u64,
}

/// Check if daemon is available (socket exists and responds to ping)
pub fn is_daemon_available(socket_path: &Path) -> bool {
    let mut client = DaemonClient::new(socket_path);
    client.ping()
}

/// Value of the daemon's `--grant` flag for `permission`
pub fn grant_arg(permission: Permission) -> &'static str {
    match permission {
        Permission::ReadSms => "sms",
        Permission::NotificationAccess => "notifications",
    }
}

/// Control surface for a daemon running in its own process
pub struct RemoteControl {
    paths: StatePaths,
    store: DurableStore,
    log: DiagnosticLog,
    grants: Vec<Permission>,
    router: Arc<EventChannelRouter>,
    notice: Mutex<Option<String>>,
}

impl RemoteControl {
    pub fn new(paths: StatePaths, grants: Vec<Permission>) -> Self {
        Self {
            store: DurableStore::open(paths.prefs_dir()),
            log: DiagnosticLog::open(paths.log_file()),
            paths,
            grants,
            router: Arc::new(EventChannelRouter::new()),
            notice: Mutex::new(None),
        }
    }

    /// Register `endpoint` as the interactive context's receiver. Returns how
    /// many buffered events were flushed into it.
    pub fn attach(&self, endpoint: &Arc<dyn Endpoint>) -> usize {
        self.router.register(Role::Interactive, endpoint)
    }

    pub fn detach(&self, endpoint: &Arc<dyn Endpoint>) -> bool {
        self.router.unregister_if(Role::Interactive, endpoint)
    }

    /// Route a daemon stream into the interactive context until it ends.
    /// Returns how many events reached an attached endpoint.
    pub fn pump(&self, subscription: impl IntoIterator<Item = DaemonResponse>) -> usize {
        let mut delivered = 0;
        for message in subscription {
            match message {
                DaemonResponse::Delivered { event } => {
                    if self.router.emit(Role::Interactive, event) == Dispatch::Delivered {
                        delivered += 1;
                    }
                }
                DaemonResponse::Signal { name } => {
                    let Some(endpoint) = self.router.registry().get(Role::Interactive) else {
                        continue;
                    };
                    if let Err(e) = endpoint.signal(&name) {
                        tracing::warn!(signal = %name, error = %e, "interactive signal failed");
                    }
                }
                other => tracing::debug!(?other, "ignoring stream message"),
            }
        }
        delivered
    }

    /// One-shot message for the user after a failed start
    pub fn take_notice(&self) -> Option<String> {
        self.notice.lock().take()
    }

    fn client(&self) -> DaemonClient {
        DaemonClient::new(self.paths.socket())
    }

    fn spawn_daemon(&self) -> Result<()> {
        let exe = std::env::current_exe().context("Failed to locate own executable")?;
        let mut command = Command::new(exe);
        command.arg("--home").arg(self.paths.root()).arg("daemon");
        for permission in &self.grants {
            command.arg("--grant").arg(grant_arg(*permission));
        }
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon")?;

        let deadline = Instant::now() + SPAWN_TIMEOUT;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().context("Failed to poll daemon")? {
                bail!("daemon exited during startup ({})", status);
            }
            if self.client().ping() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(100));
        }
        bail!("daemon did not answer within {:?}", SPAWN_TIMEOUT)
    }
}

impl Control for RemoteControl {
    fn start(&self) {
        let mut client = self.client();
        if client.ping() {
            // Already spawned; let the daemon decide whether it needs starting
            if let Err(e) = client.start() {
                self.log.append(format!("{:#}", e));
                self.store.set_running(false);
                *self.notice.lock() = Some(START_FAILED_NOTICE.to_string());
            }
            return;
        }
        if let Err(e) = self.spawn_daemon() {
            tracing::warn!(error = %e, "daemon start failed");
            self.log.append(format!(
                "Failed to start monitoring service: {:#}. Please check permissions or update the app.",
                e
            ));
            self.store.set_running(false);
            *self.notice.lock() = Some(START_FAILED_NOTICE.to_string());
        }
    }

    fn stop(&self) {
        if !self.client().shutdown() {
            tracing::debug!("daemon not reachable on stop");
        }
        self.store.set_running(false);
    }

    fn is_running(&self) -> bool {
        self.store.is_running()
    }

    fn force_flush_retry(&self) {
        self.router.broadcast(FORCE_RETRY);
        if !self.client().force_retry() {
            tracing::debug!("daemon not reachable for retry signal");
        }
    }
}
