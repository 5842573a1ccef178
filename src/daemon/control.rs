//! Control surface exposed to the interactive context.

use std::sync::Arc;

use crate::common::store::DurableStore;
use crate::common::types::FORCE_RETRY;
use crate::daemon::controller::ProcessLifecycleController;

/// User-facing controls. Nothing here reports an error; failures end up in the
/// diagnostic log and the persisted running flag.
pub trait Control {
    fn start(&self);
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Ask every attached endpoint to retry its queued deliveries
    fn force_flush_retry(&self);
}

/// Control over a controller living in this process
pub struct InProcessControl {
    controller: Arc<ProcessLifecycleController>,
    store: DurableStore,
}

impl InProcessControl {
    pub fn new(controller: Arc<ProcessLifecycleController>, store: DurableStore) -> Self {
        Self { controller, store }
    }
}

impl Control for InProcessControl {
    fn start(&self) {
        let outcome = self.controller.start();
        tracing::debug!(?outcome, "start requested");
    }

    fn stop(&self) {
        self.controller.stop();
    }

    fn is_running(&self) -> bool {
        self.store.is_running()
    }

    fn force_flush_retry(&self) {
        let report = self.controller.router().broadcast(FORCE_RETRY);
        tracing::debug!(
            attempted = report.attempted,
            failed = report.failed,
            "retry signal broadcast"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::diagnostics::DiagnosticLog;
    use crate::common::error::EndpointError;
    use crate::common::types::{CapturedEvent, Role};
    use crate::daemon::controller::{ControllerDeps, LifecycleState};
    use crate::daemon::host::PidFileHost;
    use crate::relay::{Endpoint, EventChannelRouter};
    use crate::sources::{LocalCaptureHost, SourceObserverManager, StaticPermissions};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Signals(Mutex<Vec<String>>);

    impl Endpoint for Signals {
        fn deliver(&self, _event: &CapturedEvent) -> Result<(), EndpointError> {
            Ok(())
        }

        fn signal(&self, name: &str) -> Result<(), EndpointError> {
            self.0.lock().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_in_process_control_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path().join("prefs"));
        let log = DiagnosticLog::open(dir.path().join("logs.txt"));
        let router = Arc::new(EventChannelRouter::new());
        let observers = Arc::new(SourceObserverManager::new(
            Role::Headless,
            Arc::new(LocalCaptureHost::new()),
            Arc::new(StaticPermissions::all()),
            router.clone(),
            log.clone(),
        ));
        let signals = Arc::new(Signals::default());
        let endpoint = signals.clone();
        let controller = Arc::new(ProcessLifecycleController::new(ControllerDeps {
            host: Arc::new(PidFileHost::new(dir.path().join("daemon.pid"))),
            store: store.clone(),
            log,
            router,
            observers,
            make_endpoint: Box::new(move || endpoint.clone() as Arc<dyn Endpoint>),
        }));
        let control = InProcessControl::new(controller.clone(), store);

        control.start();
        assert!(control.is_running());
        assert_eq!(controller.on_start_command(), LifecycleState::Running);

        control.force_flush_retry();
        assert_eq!(*signals.0.lock(), vec![FORCE_RETRY.to_string()]);

        control.stop();
        assert!(!control.is_running());
        assert!(!dir.path().join("daemon.pid").exists());
    }
}
