//! Capture sources and the host primitives they sit on.

pub mod local;
pub mod manager;

use std::sync::Arc;

use crate::common::error::SubscribeError;
use crate::common::types::{CaptureSource, CapturedEvent, Permission};

pub use local::{LocalCaptureHost, StaticPermissions};
pub use manager::{SkipReason, SourceObserverManager, ToggleOutcome};

/// Opaque id the host assigns to one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Answers whether the host currently grants a permission
pub trait PermissionProbe: Send + Sync {
    fn is_granted(&self, permission: Permission) -> bool;
}

/// Callback target the host invokes on its own thread for each captured event
pub trait CaptureSink: Send + Sync {
    fn on_capture(&self, event: CapturedEvent);
}

/// OS-level subscription primitive for capture sources.
///
/// Implementations must not invoke the sink from inside `subscribe` on the
/// calling thread.
pub trait CaptureHost: Send + Sync {
    fn subscribe(
        &self,
        source: CaptureSource,
        sink: Arc<dyn CaptureSink>,
    ) -> Result<SubscriptionId, SubscribeError>;

    fn unsubscribe(&self, source: CaptureSource, id: SubscriptionId);
}
