//! Unix socket server for the headless context.
//!
//! Owns the lifecycle controller and the in-process capture host. Capture
//! adapters push events in with `Capture`; subscribers receive whatever the
//! headless endpoint delivers. When a subscriber goes away, whatever was still
//! queued for it goes back into the retry queue.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::common::diagnostics::DiagnosticLog;
use crate::common::offload;
use crate::common::paths::StatePaths;
use crate::common::store::DurableStore;
use crate::common::types::{CaptureSource, Permission, Role, FORCE_RETRY};
use crate::daemon::controller::{
    ControllerDeps, LifecycleState, ProcessLifecycleController, StartOutcome,
};
use crate::daemon::endpoint::{RelayEndpoint, SubscriberRx};
use crate::daemon::host::{Host, PidFileHost};
use crate::ipc::messages::{DaemonCommand, DaemonResponse};
use crate::relay::{Endpoint, EventChannelRouter};
use crate::sources::{LocalCaptureHost, SourceObserverManager, StaticPermissions};

/// How long shutdown waits for open connections to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Shared {
    log: DiagnosticLog,
    capture: Arc<LocalCaptureHost>,
    controller: Arc<ProcessLifecycleController>,
    relay: Arc<RelayEndpoint>,
    shutdown_tx: watch::Sender<bool>,
    start_time: Instant,
}

impl Shared {
    fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Daemon server hosting the headless context
pub struct DaemonServer {
    paths: StatePaths,
    shared: Arc<Shared>,
}

impl DaemonServer {
    /// Wire up the headless context with the platform's pid-file host
    pub fn new(paths: StatePaths, granted: Vec<Permission>) -> Self {
        let host = Arc::new(PidFileHost::new(paths.pid_file()));
        Self::with_host(paths, granted, host)
    }

    pub fn with_host(paths: StatePaths, granted: Vec<Permission>, host: Arc<dyn Host>) -> Self {
        let store = DurableStore::open(paths.prefs_dir());
        let log = DiagnosticLog::open(paths.log_file());
        let (shutdown_tx, _) = watch::channel(false);

        let capture = Arc::new(LocalCaptureHost::new());
        let router = Arc::new(EventChannelRouter::new());
        let observers = Arc::new(SourceObserverManager::new(
            Role::Headless,
            capture.clone(),
            Arc::new(StaticPermissions::new(granted)),
            router.clone(),
            log.clone(),
        ));

        // One endpoint for the daemon's lifetime so subscribers outlive restarts
        let relay = Arc::new(RelayEndpoint::new(store.clone()));
        let endpoint = relay.clone();
        let controller = Arc::new(ProcessLifecycleController::new(ControllerDeps {
            host,
            store,
            log: log.clone(),
            router,
            observers,
            make_endpoint: Box::new(move || endpoint.clone() as Arc<dyn Endpoint>),
        }));

        Self {
            paths,
            shared: Arc::new(Shared {
                log,
                capture,
                controller,
                relay,
                shutdown_tx,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn controller(&self) -> &Arc<ProcessLifecycleController> {
        &self.shared.controller
    }

    /// Closure that stops `run`; safe to call from a signal handler
    pub fn shutdown_trigger(&self) -> impl Fn() + Send + Sync + 'static {
        let shared = self.shared.clone();
        move || shared.request_shutdown()
    }

    /// Start the controller and serve the socket until shut down
    pub async fn run(&self) -> Result<()> {
        self.prepare_state_dir()?;
        if let StartOutcome::Failed(failure) = self.shared.controller.start() {
            bail!("Failed to start foreground service: {}", failure);
        }
        self.serve().await
    }

    /// Like `run`, but started through the restart trigger
    pub async fn run_after_boot(&self) -> Result<()> {
        self.prepare_state_dir()?;
        self.shared.controller.handle_restart_signal();
        if self.shared.controller.state() != LifecycleState::Running {
            bail!("Service did not start after boot; see `msg-mirror logs`");
        }
        self.serve().await
    }

    fn prepare_state_dir(&self) -> Result<()> {
        fs::create_dir_all(self.paths.root()).context("Failed to create state directory")
    }

    async fn serve(&self) -> Result<()> {
        let socket_path = self.paths.socket();

        // Only reached once we hold the pid file, so any socket left is stale
        if socket_path.exists() {
            fs::remove_file(&socket_path).context("Failed to remove existing socket")?;
        }
        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.controller.stop();
                return Err(e).context("Failed to bind to socket");
            }
        };
        tracing::info!(socket = %socket_path.display(), "daemon listening");

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();
        loop {
            let stop = *shutdown_rx.borrow_and_update();
            if stop {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let shared = self.shared.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, shared).await {
                            tracing::debug!(error = %e, "connection closed with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("daemon shutting down");
        self.shared.controller.stop();
        // Subscriber streams park what they still hold on their way out
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!(left = connections.len(), "aborting idle connections");
            connections.shutdown().await;
        }
        let _ = fs::remove_file(&socket_path);
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let command: DaemonCommand = match serde_json::from_str(trimmed) {
            Ok(cmd) => cmd,
            Err(e) => {
                let response = DaemonResponse::Error {
                    message: format!("Invalid command: {}", e),
                };
                send_response(&mut writer, &response).await?;
                continue;
            }
        };

        if command == DaemonCommand::Subscribe {
            // The connection becomes a one-way stream from here on
            return stream_to_subscriber(&mut writer, &shared).await;
        }

        let response = handle_command(command, &shared).await;
        send_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Forward everything the headless endpoint publishes until the client leaves
async fn stream_to_subscriber(writer: &mut OwnedWriteHalf, shared: &Shared) -> Result<()> {
    let mut rx = shared.relay.subscribe();
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    let mut unsent = None;
    let result = match send_response(writer, &DaemonResponse::Ok).await {
        Err(e) => Err(e),
        Ok(()) => loop {
            let stop = *shutdown_rx.borrow_and_update();
            if stop {
                break Ok(());
            }
            tokio::select! {
                received = rx.recv() => match received {
                    Some(message) => {
                        if let Err(e) = send_response(writer, &message).await {
                            unsent = Some(message);
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = shutdown_rx.changed() => {}
            }
        },
    };

    let parked = reclaim(shared, &mut rx, unsent);
    if parked > 0 {
        tracing::info!(parked, "subscriber left; undelivered events parked");
    }
    result
}

/// Close `rx` and hand everything it still holds back to the retry queue
fn reclaim(shared: &Shared, rx: &mut SubscriberRx, unsent: Option<DaemonResponse>) -> usize {
    rx.close();
    let leftovers = unsent
        .into_iter()
        .chain(std::iter::from_fn(|| rx.try_recv().ok()));
    shared.relay.park_unsent(leftovers.collect::<Vec<_>>())
}

/// Handle a single command and return a response
async fn handle_command(command: DaemonCommand, shared: &Shared) -> DaemonResponse {
    match command {
        DaemonCommand::Ping => DaemonResponse::Pong,

        DaemonCommand::Status => {
            let controller = &shared.controller;
            DaemonResponse::Status {
                state: controller.state().to_string(),
                sms_observer: controller.observers().is_enabled(CaptureSource::Sms),
                notification_observer: controller
                    .observers()
                    .is_enabled(CaptureSource::Notification),
                pending_events: controller.router().pending_len(Role::Headless),
                subscriber_count: shared.relay.subscriber_count(),
                uptime_secs: shared.start_time.elapsed().as_secs(),
            }
        }

        DaemonCommand::Start => {
            if shared.controller.on_start_command() == LifecycleState::Running {
                return DaemonResponse::Ok;
            }
            match shared.controller.start() {
                StartOutcome::Failed(failure) => DaemonResponse::Error {
                    message: format!("Failed to start foreground service: {}", failure),
                },
                _ => DaemonResponse::Ok,
            }
        }

        DaemonCommand::Capture(event) => {
            let source = event.source;
            if shared.capture.inject(event) {
                DaemonResponse::Ok
            } else {
                DaemonResponse::Error {
                    message: format!("{} capture is not enabled; event dropped", source),
                }
            }
        }

        DaemonCommand::ForceRetry => {
            let report = shared.controller.router().broadcast(FORCE_RETRY);
            tracing::debug!(
                attempted = report.attempted,
                failed = report.failed,
                "retry signal broadcast"
            );
            DaemonResponse::Ok
        }

        DaemonCommand::SetSmsEnabled(enabled) => {
            let outcome = shared.controller.set_sms_capture(enabled);
            tracing::debug!(?outcome, enabled, "sms capture toggled");
            DaemonResponse::SmsObserver {
                enabled: shared.controller.observers().is_enabled(CaptureSource::Sms),
            }
        }

        // Handled at the connection level
        DaemonCommand::Subscribe => DaemonResponse::Ok,

        DaemonCommand::ReadLogs => {
            let log = shared.log.clone();
            match offload::run("read_logs", move || log.read()).await {
                Ok(entries) => DaemonResponse::Logs { entries },
                Err(e) => DaemonResponse::Error {
                    message: e.to_string(),
                },
            }
        }

        DaemonCommand::Shutdown => {
            shared.request_shutdown();
            DaemonResponse::Ok
        }
    }
}

/// Send a response to the client
async fn send_response(writer: &mut OwnedWriteHalf, response: &DaemonResponse) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
