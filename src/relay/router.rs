//! Buffering and ordered flushing of captured events per role.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::error::EndpointError;
use crate::common::types::{CapturedEvent, Role};
use crate::relay::registry::InstanceRegistry;
use crate::relay::Endpoint;

/// What `emit` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the attached endpoint
    Delivered,
    /// Queued until an endpoint attaches for the role
    Buffered,
}

/// Outcome of a fan-out; informational only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<CapturedEvent>,
    flushing: bool,
}

/// Routes events to the endpoint attached for their role.
///
/// While no endpoint is attached events are kept in memory, in arrival order,
/// and replayed once on attach. Each role has its own lock; endpoint calls are
/// made without holding it.
pub struct EventChannelRouter {
    registry: InstanceRegistry,
    interactive: Mutex<Lane>,
    headless: Mutex<Lane>,
}

impl Default for EventChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannelRouter {
    pub fn new() -> Self {
        Self {
            registry: InstanceRegistry::new(),
            interactive: Mutex::new(Lane::default()),
            headless: Mutex::new(Lane::default()),
        }
    }

    fn lane(&self, role: Role) -> &Mutex<Lane> {
        match role {
            Role::Interactive => &self.interactive,
            Role::Headless => &self.headless,
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Attach `endpoint` for `role`, replacing any previous one, and flush
    /// whatever was buffered. Returns the number of events flushed.
    pub fn register(&self, role: Role, endpoint: &Arc<dyn Endpoint>) -> usize {
        {
            let _lane = self.lane(role).lock();
            if self.registry.insert(role, endpoint) {
                tracing::debug!(role = %role, "replaced attached endpoint");
            }
        }
        self.attach(role)
    }

    /// Detach whatever endpoint is registered for `role`. Buffered events are kept.
    pub fn unregister(&self, role: Role) -> bool {
        let _lane = self.lane(role).lock();
        self.registry.remove(role)
    }

    /// Detach `endpoint` if it is still the one registered for `role`
    pub fn unregister_if(&self, role: Role, endpoint: &Arc<dyn Endpoint>) -> bool {
        let _lane = self.lane(role).lock();
        self.registry.remove_if(role, endpoint)
    }

    /// Drain the buffer for `role` into its endpoint, oldest first.
    ///
    /// Events emitted during the flush queue behind it. If another flush for
    /// the role is already running it picks up anything new, so this returns 0.
    pub fn attach(&self, role: Role) -> usize {
        let mut lane = self.lane(role).lock();
        if lane.flushing {
            return 0;
        }
        lane.flushing = true;

        let mut delivered = 0;
        loop {
            let endpoint = match self.registry.get(role) {
                Some(endpoint) if !lane.pending.is_empty() => endpoint,
                _ => {
                    lane.flushing = false;
                    break;
                }
            };
            let batch: Vec<CapturedEvent> = lane.pending.drain(..).collect();
            drop(lane);

            for event in &batch {
                deliver(role, &endpoint, event);
            }
            delivered += batch.len();

            lane = self.lane(role).lock();
        }

        if delivered > 0 {
            tracing::debug!(role = %role, count = delivered, "flushed buffered events");
        }
        delivered
    }

    /// Deliver now if `role` has an endpoint and nothing is queued ahead,
    /// otherwise buffer
    pub fn emit(&self, role: Role, event: CapturedEvent) -> Dispatch {
        let mut lane = self.lane(role).lock();
        if lane.flushing || !lane.pending.is_empty() {
            lane.pending.push_back(event);
            return Dispatch::Buffered;
        }
        match self.registry.get(role) {
            Some(endpoint) => {
                drop(lane);
                deliver(role, &endpoint, &event);
                Dispatch::Delivered
            }
            None => {
                lane.pending.push_back(event);
                Dispatch::Buffered
            }
        }
    }

    /// Send `signal` to every attached endpoint. Each send is independent;
    /// failures are logged and counted, never returned.
    pub fn broadcast(&self, signal: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (role, endpoint) in self.registry.snapshot() {
            report.attempted += 1;
            let result = catch_unwind(AssertUnwindSafe(|| endpoint.signal(signal)))
                .unwrap_or_else(|_| Err(EndpointError::Rejected("endpoint panicked".into())));
            if let Err(e) = result {
                report.failed += 1;
                tracing::warn!(role = %role, signal, error = %e, "broadcast delivery failed");
            }
        }
        report
    }

    pub fn pending_len(&self, role: Role) -> usize {
        self.lane(role).lock().pending.len()
    }

    pub fn is_attached(&self, role: Role) -> bool {
        self.registry.is_attached(role)
    }
}

/// Hand one event to an endpoint. The event counts as consumed either way;
/// retrying is the receiving context's job.
fn deliver(role: Role, endpoint: &Arc<dyn Endpoint>, event: &CapturedEvent) {
    let result = catch_unwind(AssertUnwindSafe(|| endpoint.deliver(event)))
        .unwrap_or_else(|_| Err(EndpointError::Rejected("endpoint panicked".into())));
    if let Err(e) = result {
        tracing::warn!(role = %role, source = %event.source, error = %e, "event delivery failed");
    }
}
