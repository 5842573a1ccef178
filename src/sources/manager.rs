//! Enabling and disabling capture subscriptions.
//!
//! Every source has its own slot lock. The sink handed to the host carries the
//! token it was created with and checks it under that same lock before
//! emitting, so a disable waits for an in-flight callback and any later
//! callback through the old subscription is dropped.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::diagnostics::DiagnosticLog;
use crate::common::types::{CaptureSource, CapturedEvent, Permission, Role};
use crate::relay::EventChannelRouter;
use crate::sources::{CaptureHost, CaptureSink, PermissionProbe, SubscriptionId};

/// Why an enable request left the subscription untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PermissionMissing(Permission),
    NoEndpoint(Role),
}

/// Result of a `toggle` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Enabled,
    AlreadyEnabled,
    Disabled,
    AlreadyDisabled,
    Skipped(SkipReason),
    /// The host refused the subscription
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
struct Active {
    id: SubscriptionId,
    token: u64,
}

#[derive(Default)]
struct SlotState {
    active: Option<Active>,
    next_token: u64,
}

struct Slot {
    source: CaptureSource,
    state: Mutex<SlotState>,
}

struct ObserverSink {
    slot: Arc<Slot>,
    token: u64,
    role: Role,
    router: Arc<EventChannelRouter>,
}

impl CaptureSink for ObserverSink {
    fn on_capture(&self, event: CapturedEvent) {
        let state = self.slot.state.lock();
        if state.active.map(|a| a.token) != Some(self.token) {
            tracing::debug!(source = %self.slot.source, "dropping event from retired subscription");
            return;
        }
        if event.source != self.slot.source {
            tracing::warn!(
                expected = %self.slot.source,
                got = %event.source,
                "event arrived on the wrong subscription"
            );
            return;
        }
        self.router.emit(self.role, event);
    }
}

/// Owns the capture subscriptions of one execution context
pub struct SourceObserverManager {
    role: Role,
    host: Arc<dyn CaptureHost>,
    permissions: Arc<dyn PermissionProbe>,
    router: Arc<EventChannelRouter>,
    log: DiagnosticLog,
    notification: Arc<Slot>,
    sms: Arc<Slot>,
}

impl SourceObserverManager {
    pub fn new(
        role: Role,
        host: Arc<dyn CaptureHost>,
        permissions: Arc<dyn PermissionProbe>,
        router: Arc<EventChannelRouter>,
        log: DiagnosticLog,
    ) -> Self {
        let slot = |source| {
            Arc::new(Slot {
                source,
                state: Mutex::new(SlotState::default()),
            })
        };
        Self {
            role,
            host,
            permissions,
            router,
            log,
            notification: slot(CaptureSource::Notification),
            sms: slot(CaptureSource::Sms),
        }
    }

    fn slot(&self, source: CaptureSource) -> &Arc<Slot> {
        match source {
            CaptureSource::Notification => &self.notification,
            CaptureSource::Sms => &self.sms,
        }
    }

    /// Role whose endpoint receives this manager's events
    pub fn role(&self) -> Role {
        self.role
    }

    /// Enable or disable the subscription for `source`. Idempotent.
    ///
    /// Enabling needs the source's permission and a live endpoint for the
    /// owning role; when either is missing the reason is logged and nothing
    /// changes. No retry is scheduled.
    pub fn toggle(&self, source: CaptureSource, enable: bool) -> ToggleOutcome {
        let slot = self.slot(source);
        let mut state = slot.state.lock();

        if !enable {
            let Some(active) = state.active.take() else {
                return ToggleOutcome::AlreadyDisabled;
            };
            self.host.unsubscribe(source, active.id);
            self.log
                .append(format!("{} observer unregistered (toggle)", source));
            return ToggleOutcome::Disabled;
        }

        if state.active.is_some() {
            return ToggleOutcome::AlreadyEnabled;
        }

        let permission = source.required_permission();
        if !self.permissions.is_granted(permission) {
            self.log.append(format!(
                "{} observer toggle skipped: missing permission {}",
                source, permission
            ));
            return ToggleOutcome::Skipped(SkipReason::PermissionMissing(permission));
        }

        if !self.router.is_attached(self.role) {
            self.log.append(format!(
                "{} observer toggle skipped: no {} endpoint attached",
                source, self.role
            ));
            return ToggleOutcome::Skipped(SkipReason::NoEndpoint(self.role));
        }

        let token = state.next_token;
        state.next_token += 1;
        let sink = Arc::new(ObserverSink {
            slot: slot.clone(),
            token,
            role: self.role,
            router: self.router.clone(),
        });

        match self.host.subscribe(source, sink) {
            Ok(id) => {
                state.active = Some(Active { id, token });
                self.log.append(format!("{} observer registered", source));
                ToggleOutcome::Enabled
            }
            Err(e) => {
                self.log
                    .append(format!("{} observer registration failed: {}", source, e));
                ToggleOutcome::Failed(e.to_string())
            }
        }
    }

    /// Disable every active subscription
    pub fn disable_all(&self) {
        for source in CaptureSource::ALL {
            self.toggle(source, false);
        }
    }

    pub fn is_enabled(&self, source: CaptureSource) -> bool {
        self.slot(source).state.lock().active.is_some()
    }
}

impl Drop for SourceObserverManager {
    fn drop(&mut self) {
        self.disable_all();
    }
}
