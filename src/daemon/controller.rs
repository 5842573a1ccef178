//! Lifecycle of the headless process.
//!
//! `Stopped -> Starting -> Running`, or `Starting -> Failed -> Stopped` when the
//! host refuses promotion. Every transition is written to the diagnostic log.
//! Nothing here returns an error to the caller; outcomes are informational.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use scopeguard::ScopeGuard;

use crate::common::diagnostics::DiagnosticLog;
use crate::common::error::StartupFailure;
use crate::common::store::DurableStore;
use crate::common::types::{CaptureSource, Role};
use crate::daemon::host::{ForegroundNotice, Host};
use crate::relay::{Endpoint, EventChannelRouter};
use crate::sources::{SourceObserverManager, ToggleOutcome};

/// Builds the endpoint registered once the process is running
pub type EndpointFactory = Box<dyn Fn() -> Arc<dyn Endpoint> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "STOPPED"),
            LifecycleState::Starting => write!(f, "STARTING"),
            LifecycleState::Running => write!(f, "RUNNING"),
            LifecycleState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        /// Events buffered before the endpoint existed
        flushed: usize,
    },
    AlreadyRunning,
    Failed(StartupFailure),
}

/// Everything the controller wires together
pub struct ControllerDeps {
    pub host: Arc<dyn Host>,
    pub store: DurableStore,
    pub log: DiagnosticLog,
    pub router: Arc<EventChannelRouter>,
    pub observers: Arc<SourceObserverManager>,
    pub make_endpoint: EndpointFactory,
}

struct Inner {
    state: LifecycleState,
    endpoint: Option<Arc<dyn Endpoint>>,
}

pub struct ProcessLifecycleController {
    host: Arc<dyn Host>,
    store: DurableStore,
    log: DiagnosticLog,
    router: Arc<EventChannelRouter>,
    observers: Arc<SourceObserverManager>,
    make_endpoint: EndpointFactory,
    notice: ForegroundNotice,
    inner: Mutex<Inner>,
}

impl ProcessLifecycleController {
    pub fn new(deps: ControllerDeps) -> Self {
        Self {
            host: deps.host,
            store: deps.store,
            log: deps.log,
            router: deps.router,
            observers: deps.observers,
            make_endpoint: deps.make_endpoint,
            notice: ForegroundNotice::default(),
            inner: Mutex::new(Inner {
                state: LifecycleState::Stopped,
                endpoint: None,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn router(&self) -> &Arc<EventChannelRouter> {
        &self.router
    }

    pub fn observers(&self) -> &Arc<SourceObserverManager> {
        &self.observers
    }

    fn transition(&self, inner: &mut Inner, next: LifecycleState) {
        let prev = inner.state;
        inner.state = next;
        tracing::info!(from = %prev, to = %next, "lifecycle transition");
        self.log.append(format!("lifecycle: {} -> {}", prev, next));
    }

    /// Promote the process and wire the relay. A refused promotion is final
    /// for this call; nothing retries it.
    pub fn start(&self) -> StartOutcome {
        let mut inner = self.inner.lock();
        if matches!(inner.state, LifecycleState::Running | LifecycleState::Starting) {
            self.log.append(format!("start ignored: already {}", inner.state));
            return StartOutcome::AlreadyRunning;
        }

        self.transition(&mut inner, LifecycleState::Starting);
        let promoted = self.host.promote(&self.notice).and_then(|()| {
            if self.host.is_promoted() {
                Ok(())
            } else {
                Err(StartupFailure::Unverified)
            }
        });

        if let Err(failure) = promoted {
            self.transition(&mut inner, LifecycleState::Failed);
            self.log.append(format!(
                "Failed to start foreground service: {}. If this persists, ensure required permissions are granted and the app is up to date.",
                failure
            ));
            self.store.set_running(false);
            self.host.release();
            self.transition(&mut inner, LifecycleState::Stopped);
            return StartOutcome::Failed(failure);
        }

        // Unwinding out of the wiring below must leave us Stopped and unpromoted
        let host = self.host.clone();
        let store = self.store.clone();
        let log = self.log.clone();
        let mut inner = scopeguard::guard(inner, move |mut inner| {
            inner.endpoint = None;
            inner.state = LifecycleState::Stopped;
            store.set_running(false);
            host.release();
            log.append("start aborted while wiring the relay; promotion released");
        });

        self.transition(&mut inner, LifecycleState::Running);
        let endpoint = (self.make_endpoint)();
        let flushed = self.router.register(Role::Headless, &endpoint);
        inner.endpoint = Some(endpoint);
        if flushed > 0 {
            self.log
                .append(format!("flushed {} buffered event(s) to headless endpoint", flushed));
        }
        self.store.set_running(true);
        self.apply_capture_settings();

        drop(ScopeGuard::into_inner(inner));
        StartOutcome::Started { flushed }
    }

    /// Re-apply the stored capture settings to the observers
    pub fn apply_capture_settings(&self) {
        self.observers
            .toggle(CaptureSource::Sms, self.store.sms_capture_enabled());
        self.observers.toggle(CaptureSource::Notification, true);
    }

    /// Persist the SMS capture flag and apply it right away
    pub fn set_sms_capture(&self, enabled: bool) -> ToggleOutcome {
        self.store.set_sms_capture_enabled(enabled);
        self.observers.toggle(CaptureSource::Sms, enabled)
    }

    /// Tear down the relay. Returns false when already stopped.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == LifecycleState::Stopped {
            self.store.set_running(false);
            return false;
        }

        if let Some(endpoint) = inner.endpoint.take() {
            self.router.unregister_if(Role::Headless, &endpoint);
        }
        self.observers.disable_all();
        self.store.set_running(false);
        self.host.release();
        self.transition(&mut inner, LifecycleState::Stopped);
        true
    }

    /// Host asked to (re)deliver the start command
    pub fn on_start_command(&self) -> LifecycleState {
        self.log.append("start command received");
        self.state()
    }

    /// Device-restart trigger. Best-effort; never fails or unwinds.
    pub fn handle_restart_signal(&self) {
        self.log.append("boot completed");
        match catch_unwind(AssertUnwindSafe(|| self.start())) {
            Ok(StartOutcome::Failed(failure)) => {
                self.log
                    .append(format!("Failed to auto-start service after boot: {}", failure));
            }
            Ok(_) => {}
            Err(_) => {
                self.log
                    .append("Failed to auto-start service after boot: start panicked");
            }
        }
    }
}

impl Drop for ProcessLifecycleController {
    fn drop(&mut self) {
        let running = self.inner.get_mut().state != LifecycleState::Stopped;
        if running {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::EndpointError;
    use crate::common::types::{CapturedEvent, Permission};
    use crate::sources::{LocalCaptureHost, StaticPermissions};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHost {
        refuse: bool,
        promoted: AtomicBool,
        releases: AtomicUsize,
    }

    impl Host for FakeHost {
        fn promote(&self, _notice: &ForegroundNotice) -> Result<(), StartupFailure> {
            if self.refuse {
                return Err(StartupFailure::Rejected("foreground start not allowed".into()));
            }
            self.promoted.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_promoted(&self) -> bool {
            self.promoted.load(Ordering::SeqCst)
        }

        fn release(&self) {
            self.promoted.store(false, Ordering::SeqCst);
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<CapturedEvent>>,
    }

    impl Endpoint for Recorder {
        fn deliver(&self, event: &CapturedEvent) -> Result<(), EndpointError> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        fn signal(&self, _name: &str) -> Result<(), EndpointError> {
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: DurableStore,
        log: DiagnosticLog,
        host: Arc<FakeHost>,
        capture: Arc<LocalCaptureHost>,
        recorder: Arc<Recorder>,
        controller: ProcessLifecycleController,
    }

    fn harness(refuse: bool, granted: &[Permission]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path().join("prefs"));
        let log = DiagnosticLog::open(dir.path().join("logs.txt"));
        let host = Arc::new(FakeHost {
            refuse,
            ..FakeHost::default()
        });
        let capture = Arc::new(LocalCaptureHost::new());
        let router = Arc::new(EventChannelRouter::new());
        let observers = Arc::new(SourceObserverManager::new(
            Role::Headless,
            capture.clone(),
            Arc::new(StaticPermissions::new(granted.iter().copied())),
            router.clone(),
            log.clone(),
        ));
        let recorder = Arc::new(Recorder::default());
        let factory_recorder = recorder.clone();
        let controller = ProcessLifecycleController::new(ControllerDeps {
            host: host.clone(),
            store: store.clone(),
            log: log.clone(),
            router,
            observers,
            make_endpoint: Box::new(move || factory_recorder.clone() as Arc<dyn Endpoint>),
        });
        Harness {
            _dir: dir,
            store,
            log,
            host,
            capture,
            recorder,
            controller,
        }
    }

    fn messages(log: &DiagnosticLog) -> Vec<String> {
        log.read().into_iter().map(|e| e.message).collect()
    }

    mod start {
        use super::*;

        #[test]
        fn test_start_runs_and_persists_flag() {
            let h = harness(false, &[Permission::ReadSms, Permission::NotificationAccess]);
            assert_eq!(h.controller.start(), StartOutcome::Started { flushed: 0 });

            assert_eq!(h.controller.state(), LifecycleState::Running);
            assert!(h.store.is_running());
            assert!(h.controller.router().is_attached(Role::Headless));
            assert!(h.controller.observers().is_enabled(CaptureSource::Sms));
            assert!(h.controller.observers().is_enabled(CaptureSource::Notification));

            let log = messages(&h.log);
            assert!(log.contains(&"lifecycle: STOPPED -> STARTING".to_string()));
            assert!(log.contains(&"lifecycle: STARTING -> RUNNING".to_string()));
        }

        #[test]
        fn test_start_flushes_buffered_events() {
            let h = harness(false, &[]);
            h.controller
                .router()
                .emit(Role::Headless, CapturedEvent::sms("+1555", "early", 1));

            assert_eq!(h.controller.start(), StartOutcome::Started { flushed: 1 });
            assert_eq!(h.recorder.events.lock().len(), 1);
            assert_eq!(h.controller.router().pending_len(Role::Headless), 0);
        }

        #[test]
        fn test_refused_promotion_fails_and_stops() {
            let h = harness(true, &[Permission::ReadSms]);
            let outcome = h.controller.start();

            assert!(matches!(outcome, StartOutcome::Failed(StartupFailure::Rejected(_))));
            assert_eq!(h.controller.state(), LifecycleState::Stopped);
            assert!(!h.store.is_running());
            assert!(!h.controller.router().is_attached(Role::Headless));

            let log = messages(&h.log);
            assert!(log.contains(&"lifecycle: STARTING -> FAILED".to_string()));
            assert!(log.contains(&"lifecycle: FAILED -> STOPPED".to_string()));
            assert!(log
                .iter()
                .any(|m| m.starts_with("Failed to start foreground service")));
        }

        #[test]
        fn test_start_twice_is_noop() {
            let h = harness(false, &[]);
            h.controller.start();
            assert_eq!(h.controller.start(), StartOutcome::AlreadyRunning);
        }

        #[test]
        fn test_sms_disabled_setting_is_respected() {
            let h = harness(false, &[Permission::ReadSms]);
            h.store.set_sms_capture_enabled(false);
            h.controller.start();
            assert!(!h.controller.observers().is_enabled(CaptureSource::Sms));
        }

        #[test]
        fn test_missing_permission_does_not_block_start() {
            let h = harness(false, &[]);
            assert_eq!(h.controller.start(), StartOutcome::Started { flushed: 0 });
            assert!(!h.controller.observers().is_enabled(CaptureSource::Sms));
            assert!(messages(&h.log)
                .iter()
                .any(|m| m.contains("missing permission READ_SMS")));
        }
    }

    mod wiring_panic {
        use super::*;

        #[test]
        fn test_panic_while_wiring_leaves_stopped_and_retryable() {
            let dir = tempfile::tempdir().unwrap();
            let store = DurableStore::open(dir.path().join("prefs"));
            let log = DiagnosticLog::open(dir.path().join("logs.txt"));
            let host = Arc::new(FakeHost::default());
            let router = Arc::new(EventChannelRouter::new());
            let observers = Arc::new(SourceObserverManager::new(
                Role::Headless,
                Arc::new(LocalCaptureHost::new()),
                Arc::new(StaticPermissions::new(Vec::<Permission>::new())),
                router.clone(),
                log.clone(),
            ));
            let fail_next = Arc::new(AtomicBool::new(true));
            let factory_flag = fail_next.clone();
            let recorder = Arc::new(Recorder::default());
            let controller = ProcessLifecycleController::new(ControllerDeps {
                host: host.clone(),
                store: store.clone(),
                log: log.clone(),
                router,
                observers,
                make_endpoint: Box::new(move || {
                    if factory_flag.swap(false, Ordering::SeqCst) {
                        panic!("endpoint construction failed");
                    }
                    recorder.clone() as Arc<dyn Endpoint>
                }),
            });

            let unwound = catch_unwind(AssertUnwindSafe(|| controller.start()));
            assert!(unwound.is_err());
            assert_eq!(controller.state(), LifecycleState::Stopped);
            assert!(!host.is_promoted());
            assert!(!store.is_running());
            assert!(messages(&log)
                .iter()
                .any(|m| m.starts_with("start aborted while wiring")));

            assert_eq!(controller.start(), StartOutcome::Started { flushed: 0 });
            assert_eq!(controller.state(), LifecycleState::Running);
            assert!(host.is_promoted());
        }
    }

    mod stop {
        use super::*;

        #[test]
        fn test_stop_tears_down() {
            let h = harness(false, &[Permission::ReadSms]);
            h.controller.start();
            assert!(h.controller.stop());

            assert_eq!(h.controller.state(), LifecycleState::Stopped);
            assert!(!h.store.is_running());
            assert!(!h.controller.router().is_attached(Role::Headless));
            assert_eq!(h.capture.subscription_count(), 0);
            assert!(!h.host.is_promoted());
        }

        #[test]
        fn test_stop_is_idempotent() {
            let h = harness(false, &[]);
            h.controller.start();
            assert!(h.controller.stop());
            assert!(!h.controller.stop());
            assert!(!h.store.is_running());
        }

        #[test]
        fn test_events_after_stop_are_buffered() {
            let h = harness(false, &[]);
            h.controller.start();
            h.controller.stop();
            h.controller
                .router()
                .emit(Role::Headless, CapturedEvent::sms("+1", "later", 2));
            assert_eq!(h.controller.router().pending_len(Role::Headless), 1);
            assert!(h.recorder.events.lock().is_empty());
        }
    }

    mod toggles {
        use super::*;

        #[test]
        fn test_set_sms_capture_persists_and_applies() {
            let h = harness(false, &[Permission::ReadSms]);
            h.controller.start();

            assert_eq!(h.controller.set_sms_capture(false), ToggleOutcome::Disabled);
            assert!(!h.store.sms_capture_enabled());
            assert_eq!(h.controller.set_sms_capture(true), ToggleOutcome::Enabled);
            assert!(h.store.sms_capture_enabled());
        }
    }

    mod restart {
        use super::*;

        #[test]
        fn test_restart_signal_starts() {
            let h = harness(false, &[]);
            h.controller.handle_restart_signal();
            assert_eq!(h.controller.state(), LifecycleState::Running);
            assert!(messages(&h.log).contains(&"boot completed".to_string()));
        }

        #[test]
        fn test_restart_signal_failure_is_logged_not_raised() {
            let h = harness(true, &[]);
            h.controller.handle_restart_signal();
            assert_eq!(h.controller.state(), LifecycleState::Stopped);
            assert!(messages(&h.log)
                .iter()
                .any(|m| m.starts_with("Failed to auto-start service after boot")));
            assert!(h.host.releases.load(Ordering::SeqCst) >= 1);
        }
    }
}
