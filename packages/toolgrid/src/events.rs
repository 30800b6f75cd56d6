use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    RwLock,
};

use toolgrid_types::GatewayEvent;

pub type SubscriberId = u64;

type Callback = Box<dyn Fn(&GatewayEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    /// None = every event kind.
    kinds: Option<Vec<&'static str>>,
    callback: Callback,
}

/// In-process fan-out of domain events. Delivery is synchronous in the
/// publisher's thread; for one subscriber, events arrive in publish
/// order. A panicking subscriber is logged and does not disturb the
/// publisher or other subscribers. Nothing is persisted here — durable
/// fan-out is the webhook service's job.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.add(None, Box::new(callback))
    }

    pub fn subscribe_kinds<F>(&self, kinds: &[&'static str], callback: F) -> SubscriberId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.add(Some(kinds.to_vec()), Box::new(callback))
    }

    fn add(&self, kinds: Option<Vec<&'static str>>, callback: Callback) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().unwrap().push(Subscriber {
            id,
            kinds,
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers
            .write()
            .unwrap()
            .retain(|sub| sub.id != id);
    }

    pub fn publish(&self, event: GatewayEvent) {
        let kind = event.kind();
        let subscribers = self.subscribers.read().unwrap();
        for sub in subscribers.iter() {
            if let Some(kinds) = &sub.kinds {
                if !kinds.contains(&kind) {
                    continue;
                }
            }
            if catch_unwind(AssertUnwindSafe(|| (sub.callback)(&event))).is_err() {
                tracing::error!(subscriber = sub.id, kind, "event subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
