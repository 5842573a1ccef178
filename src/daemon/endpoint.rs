//! Endpoint of the headless context.
//!
//! Every socket subscriber gets its own unbounded queue, so a slow reader
//! never pushes events out from under anyone. With nobody subscribed, events
//! are parked in the persisted retry queue, which a `forceRetry` signal drains
//! once a subscriber is back. Whatever a departing subscriber never received
//! is handed back through `park_unsent`. Delivery is at least once.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::common::error::EndpointError;
use crate::common::store::DurableStore;
use crate::common::types::{CapturedEvent, FORCE_RETRY};
use crate::ipc::messages::DaemonResponse;
use crate::relay::Endpoint;

/// Receiving half handed to one subscriber connection
pub type SubscriberRx = mpsc::UnboundedReceiver<DaemonResponse>;

pub struct RelayEndpoint {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DaemonResponse>>>,
    store: DurableStore,
    /// Held for every publish-or-park decision and every queue rewrite
    queue_lock: Mutex<()>,
}

impl RelayEndpoint {
    pub fn new(store: DurableStore) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            store,
            queue_lock: Mutex::new(()),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> SubscriberRx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Hand `message` to every live subscriber; false when nobody took it
    fn publish(&self, message: &DaemonResponse) -> bool {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        !subscribers.is_empty()
    }

    fn load_queue(&self) -> Vec<CapturedEvent> {
        let raw = self.store.retry_queue();
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "retry queue unreadable, starting empty");
            Vec::new()
        })
    }

    fn save_queue(&self, queue: &[CapturedEvent]) -> Result<(), EndpointError> {
        let encoded =
            serde_json::to_string(queue).map_err(|e| EndpointError::Rejected(e.to_string()))?;
        self.store.set_retry_queue(&encoded);
        Ok(())
    }

    /// Append to the persisted queue. Caller holds `queue_lock`.
    fn park(&self, events: impl IntoIterator<Item = CapturedEvent>) -> Result<usize, EndpointError> {
        let mut queue = self.load_queue();
        let before = queue.len();
        queue.extend(events);
        let added = queue.len() - before;
        if added > 0 {
            self.save_queue(&queue)?;
            tracing::debug!(added, queued = queue.len(), "events parked in retry queue");
        }
        Ok(added)
    }

    /// Park the delivered events among `messages`, which a subscriber never
    /// received. Returns how many were parked.
    pub fn park_unsent(&self, messages: impl IntoIterator<Item = DaemonResponse>) -> usize {
        let events = messages.into_iter().filter_map(|message| match message {
            DaemonResponse::Delivered { event } => Some(event),
            _ => None,
        });
        let _guard = self.queue_lock.lock();
        self.park(events).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to park unsent events");
            0
        })
    }

    /// Publish every queued event. Returns how many went out.
    pub fn flush_retry_queue(&self) -> usize {
        let _guard = self.queue_lock.lock();
        let queue = self.load_queue();
        if queue.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for event in &queue {
            if !self.publish(&DaemonResponse::Delivered {
                event: event.clone(),
            }) {
                break;
            }
            sent += 1;
        }
        if self.save_queue(&queue[sent..]).is_err() {
            tracing::warn!("failed to persist retry queue after flush");
        }
        sent
    }
}

impl Endpoint for RelayEndpoint {
    fn deliver(&self, event: &CapturedEvent) -> Result<(), EndpointError> {
        let _guard = self.queue_lock.lock();
        let message = DaemonResponse::Delivered {
            event: event.clone(),
        };
        if self.publish(&message) {
            return Ok(());
        }
        self.park([event.clone()]).map(|_| ())
    }

    fn signal(&self, name: &str) -> Result<(), EndpointError> {
        if name == FORCE_RETRY {
            let sent = self.flush_retry_queue();
            tracing::info!(sent, "retry queue flushed");
        }
        // Listeners are optional for signals
        self.publish(&DaemonResponse::Signal {
            name: name.to_string(),
        });
        Ok(())
    }
}
