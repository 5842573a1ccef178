//! In-process capture host and permission set.
//!
//! Used by the daemon, where capture adapters push events over the socket
//! instead of an OS content observer calling back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::error::SubscribeError;
use crate::common::types::{CaptureSource, CapturedEvent, Permission};
use crate::sources::{CaptureHost, CaptureSink, PermissionProbe, SubscriptionId};

/// Capture host whose "OS callbacks" are explicit `inject` calls
#[derive(Default)]
pub struct LocalCaptureHost {
    sinks: Mutex<HashMap<CaptureSource, (SubscriptionId, Arc<dyn CaptureSink>)>>,
    next_id: AtomicU64,
    subscribes: AtomicU64,
}

impl LocalCaptureHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `event` to the subscription for its source, if any.
    ///
    /// The sink runs on the caller's thread after the host's own lock is
    /// released. Returns false when nothing is subscribed.
    pub fn inject(&self, event: CapturedEvent) -> bool {
        let Some(sink) = self.sink_for(event.source) else {
            tracing::debug!(source = %event.source, "no subscription, dropping captured event");
            return false;
        };
        sink.on_capture(event);
        true
    }

    pub fn sink_for(&self, source: CaptureSource) -> Option<Arc<dyn CaptureSink>> {
        self.sinks
            .lock()
            .get(&source)
            .map(|(_, sink)| sink.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Subscriptions ever accepted
    pub fn total_subscribes(&self) -> u64 {
        self.subscribes.load(Ordering::SeqCst)
    }
}

impl CaptureHost for LocalCaptureHost {
    fn subscribe(
        &self,
        source: CaptureSource,
        sink: Arc<dyn CaptureSink>,
    ) -> Result<SubscriptionId, SubscribeError> {
        let mut sinks = self.sinks.lock();
        if sinks.contains_key(&source) {
            return Err(SubscribeError {
                capture: source,
                reason: "already subscribed".into(),
            });
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        sinks.insert(source, (id, sink));
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn unsubscribe(&self, source: CaptureSource, id: SubscriptionId) {
        let mut sinks = self.sinks.lock();
        if sinks.get(&source).is_some_and(|(current, _)| *current == id) {
            sinks.remove(&source);
        }
    }
}

/// Fixed set of granted permissions, changeable at runtime
#[derive(Debug, Default)]
pub struct StaticPermissions {
    granted: RwLock<HashSet<Permission>>,
}

impl StaticPermissions {
    pub fn new(granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: RwLock::new(granted.into_iter().collect()),
        }
    }

    pub fn all() -> Self {
        Self::new([Permission::NotificationAccess, Permission::ReadSms])
    }

    pub fn grant(&self, permission: Permission) {
        self.granted.write().insert(permission);
    }

    pub fn revoke(&self, permission: Permission) {
        self.granted.write().remove(&permission);
    }
}

impl PermissionProbe for StaticPermissions {
    fn is_granted(&self, permission: Permission) -> bool {
        self.granted.read().contains(&permission)
    }
}
