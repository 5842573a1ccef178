//! Routing of captured events to whichever execution context is attached.

pub mod registry;
pub mod router;

use crate::common::error::EndpointError;
use crate::common::types::CapturedEvent;

pub use registry::InstanceRegistry;
pub use router::{BroadcastReport, Dispatch, EventChannelRouter};

/// Handle through which the relay reaches one execution context.
///
/// Owned by the context; the registry only keeps a weak reference, so an
/// endpoint that its owner drops counts as detached.
pub trait Endpoint: Send + Sync {
    /// Hand over one captured event. Called once per event.
    fn deliver(&self, event: &CapturedEvent) -> Result<(), EndpointError>;

    /// Send a named control signal with no payload
    fn signal(&self, name: &str) -> Result<(), EndpointError>;
}
