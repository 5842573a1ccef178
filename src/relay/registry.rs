//! Per-process cache of the endpoint attached for each role.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::common::types::Role;
use crate::relay::Endpoint;

/// Maps a role to its currently attached endpoint.
///
/// Holds at most one endpoint per role; inserting replaces the previous one
/// wholesale. References are weak, the owning context keeps the `Arc`.
#[derive(Default)]
pub struct InstanceRegistry {
    slots: Mutex<HashMap<Role, Weak<dyn Endpoint>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `endpoint` for `role`, returning whether a live one was replaced
    pub fn insert(&self, role: Role, endpoint: &Arc<dyn Endpoint>) -> bool {
        let previous = self
            .slots
            .lock()
            .insert(role, Arc::downgrade(endpoint));
        previous.is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Forget the endpoint for `role`
    pub fn remove(&self, role: Role) -> bool {
        self.slots.lock().remove(&role).is_some()
    }

    /// Forget the endpoint for `role` only if it is `endpoint`
    pub fn remove_if(&self, role: Role, endpoint: &Arc<dyn Endpoint>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&role) {
            Some(current) if same_endpoint(current, endpoint) => {
                slots.remove(&role);
                true
            }
            _ => false,
        }
    }

    /// Live endpoint for `role`. A dropped endpoint is pruned and reported as absent.
    pub fn get(&self, role: Role) -> Option<Arc<dyn Endpoint>> {
        let mut slots = self.slots.lock();
        let endpoint = slots.get(&role)?.upgrade();
        if endpoint.is_none() {
            slots.remove(&role);
        }
        endpoint
    }

    pub fn is_attached(&self, role: Role) -> bool {
        self.get(role).is_some()
    }

    /// Every live endpoint at this instant
    pub fn snapshot(&self) -> Vec<(Role, Arc<dyn Endpoint>)> {
        let mut slots = self.slots.lock();
        slots.retain(|_, weak| weak.strong_count() > 0);
        let mut live: Vec<_> = slots
            .iter()
            .filter_map(|(role, weak)| weak.upgrade().map(|ep| (*role, ep)))
            .collect();
        live.sort_by_key(|(role, _)| *role as u8);
        live
    }
}

fn same_endpoint(weak: &Weak<dyn Endpoint>, endpoint: &Arc<dyn Endpoint>) -> bool {
    std::ptr::eq(
        weak.as_ptr() as *const (),
        Arc::as_ptr(endpoint) as *const (),
    )
}
