//! End-to-end routing through the public library API.

use std::sync::Arc;

use parking_lot::Mutex;

use msg_mirror::common::diagnostics::DiagnosticLog;
use msg_mirror::common::error::EndpointError;
use msg_mirror::common::store::{DurableStore, DEFAULT_PAYLOAD_TEMPLATE};
use msg_mirror::common::types::{CaptureSource, CapturedEvent, Permission, Role, FORCE_RETRY};
use msg_mirror::relay::{Dispatch, Endpoint, EventChannelRouter};
use msg_mirror::sources::{
    LocalCaptureHost, SkipReason, SourceObserverManager, StaticPermissions, ToggleOutcome,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<CapturedEvent>>,
    signals: Mutex<Vec<String>>,
}

impl Recorder {
    fn bodies(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.body.clone()).collect()
    }
}

impl Endpoint for Recorder {
    fn deliver(&self, event: &CapturedEvent) -> Result<(), EndpointError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn signal(&self, name: &str) -> Result<(), EndpointError> {
        self.signals.lock().push(name.to_string());
        Ok(())
    }
}

fn as_endpoint(recorder: &Arc<Recorder>) -> Arc<dyn Endpoint> {
    recorder.clone()
}

#[test]
fn test_buffer_then_attach_then_live_delivery() {
    let router = EventChannelRouter::new();
    let first = CapturedEvent::sms("+1555", "hi", 1_000);
    let second = CapturedEvent::sms("+1555", "bye", 2_000);

    assert_eq!(router.emit(Role::Headless, first.clone()), Dispatch::Buffered);
    assert_eq!(router.pending_len(Role::Headless), 1);

    let recorder = Arc::new(Recorder::default());
    let endpoint = as_endpoint(&recorder);
    assert_eq!(router.register(Role::Headless, &endpoint), 1);
    assert_eq!(*recorder.events.lock(), vec![first.clone()]);
    assert_eq!(router.pending_len(Role::Headless), 0);

    assert_eq!(router.emit(Role::Headless, second.clone()), Dispatch::Delivered);
    assert_eq!(*recorder.events.lock(), vec![first, second]);
    assert_eq!(router.pending_len(Role::Headless), 0);
}

#[test]
fn test_buffered_sequence_keeps_arrival_order() {
    let router = EventChannelRouter::new();
    for i in 0..20 {
        router.emit(Role::Interactive, CapturedEvent::sms("+1", format!("m{}", i), i));
    }

    let recorder = Arc::new(Recorder::default());
    router.register(Role::Interactive, &as_endpoint(&recorder));

    let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
    assert_eq!(recorder.bodies(), expected);
}

#[test]
fn test_replaced_endpoint_gets_nothing_new() {
    let router = EventChannelRouter::new();
    let a = Arc::new(Recorder::default());
    let b = Arc::new(Recorder::default());
    let a_endpoint = as_endpoint(&a);
    let b_endpoint = as_endpoint(&b);

    router.register(Role::Headless, &a_endpoint);
    router.register(Role::Headless, &b_endpoint);
    router.emit(Role::Headless, CapturedEvent::sms("+1", "after", 3));

    assert!(a.events.lock().is_empty());
    assert_eq!(b.bodies(), vec!["after"]);
}

#[test]
fn test_roles_are_independent() {
    let router = EventChannelRouter::new();
    let headless = Arc::new(Recorder::default());
    let endpoint = as_endpoint(&headless);
    router.register(Role::Headless, &endpoint);

    assert_eq!(
        router.emit(Role::Interactive, CapturedEvent::sms("+1", "ui", 1)),
        Dispatch::Buffered
    );
    assert!(headless.events.lock().is_empty());
}

#[test]
fn test_force_retry_with_no_endpoints_is_quiet() {
    let router = EventChannelRouter::new();
    let report = router.broadcast(FORCE_RETRY);
    assert_eq!(report.attempted, 0);
    assert_eq!(report.failed, 0);
}

#[test]
fn test_force_retry_reaches_every_role() {
    let router = EventChannelRouter::new();
    let ui = Arc::new(Recorder::default());
    let bg = Arc::new(Recorder::default());
    let ui_endpoint = as_endpoint(&ui);
    let bg_endpoint = as_endpoint(&bg);
    router.register(Role::Interactive, &ui_endpoint);
    router.register(Role::Headless, &bg_endpoint);

    let report = router.broadcast(FORCE_RETRY);
    assert_eq!(report.attempted, 2);
    assert_eq!(*ui.signals.lock(), vec![FORCE_RETRY.to_string()]);
    assert_eq!(*bg.signals.lock(), vec![FORCE_RETRY.to_string()]);
}

#[test]
fn test_captured_sms_flows_through_observer_to_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let log = DiagnosticLog::open(dir.path().join("logs.txt"));
    let capture = Arc::new(LocalCaptureHost::new());
    let router = Arc::new(EventChannelRouter::new());
    let manager = SourceObserverManager::new(
        Role::Headless,
        capture.clone(),
        Arc::new(StaticPermissions::all()),
        router.clone(),
        log,
    );

    let recorder = Arc::new(Recorder::default());
    let endpoint = as_endpoint(&recorder);
    router.register(Role::Headless, &endpoint);

    assert_eq!(manager.toggle(CaptureSource::Sms, true), ToggleOutcome::Enabled);
    assert_eq!(manager.toggle(CaptureSource::Sms, true), ToggleOutcome::AlreadyEnabled);
    assert_eq!(capture.total_subscribes(), 1);

    assert!(capture.inject(CapturedEvent::sms("+1555", "hello", 10)));
    assert_eq!(recorder.bodies(), vec!["hello"]);

    manager.toggle(CaptureSource::Sms, false);
    assert!(!capture.inject(CapturedEvent::sms("+1555", "dropped", 11)));
    assert_eq!(recorder.bodies(), vec!["hello"]);
}

#[test]
fn test_missing_permission_is_logged_each_time() {
    let dir = tempfile::tempdir().unwrap();
    let log = DiagnosticLog::open(dir.path().join("logs.txt"));
    let capture = Arc::new(LocalCaptureHost::new());
    let router = Arc::new(EventChannelRouter::new());
    let manager = SourceObserverManager::new(
        Role::Headless,
        capture.clone(),
        Arc::new(StaticPermissions::new([Permission::NotificationAccess])),
        router,
        log.clone(),
    );

    let skipped = ToggleOutcome::Skipped(SkipReason::PermissionMissing(Permission::ReadSms));
    assert_eq!(manager.toggle(CaptureSource::Sms, true), skipped);
    assert_eq!(manager.toggle(CaptureSource::Sms, true), skipped);

    assert_eq!(capture.subscription_count(), 0);
    let mentions = log
        .read()
        .iter()
        .filter(|e| e.message.contains("READ_SMS"))
        .count();
    assert_eq!(mentions, 2);
}

#[test]
fn test_payload_template_default() {
    let dir = tempfile::tempdir().unwrap();
    let store = DurableStore::open(dir.path());
    let template = store.payload_template();

    assert_eq!(template, DEFAULT_PAYLOAD_TEMPLATE);
    for placeholder in ["{{body}}", "{{from}}", "{{date}}"] {
        assert!(template.contains(placeholder));
    }
}
