use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::action::{ActionContext, ActionFilter};
use crate::value::SubscriptionId;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubscriberEntry<T> {
    id: SubscriptionId,
    callback: Callback<T>,
}

impl<T> Clone for SubscriberEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: self.callback.clone(),
        }
    }
}

struct Delivery<T> {
    queue: VecDeque<T>,
    busy: bool,
}

/// Multicast event source with FIFO re-entrancy.
///
/// An event published while another one is being delivered is queued and
/// delivered only after the in-flight event reached every subscriber.
/// Queued events go out in publish order. Each event is delivered to the
/// subscribers present when its delivery starts.
pub struct OrderedBroadcaster<T> {
    delivery: Mutex<Delivery<T>>,
    subscribers: RwLock<Vec<SubscriberEntry<T>>>,
    next_id: AtomicU64,
}

/// The `{action, status}` envelope stream.
pub type ActionStream = OrderedBroadcaster<ActionContext>;

impl<T> OrderedBroadcaster<T> {
    pub fn new() -> Self {
        Self {
            delivery: Mutex::new(Delivery {
                queue: VecDeque::new(),
                busy: false,
            }),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event, or queue it behind the delivery in progress.
    pub fn publish(&self, event: T) {
        {
            let mut delivery = self.delivery.lock().unwrap();
            delivery.queue.push_back(event);
            if delivery.busy {
                return;
            }
            delivery.busy = true;
        }

        loop {
            let next = {
                let mut delivery = self.delivery.lock().unwrap();
                match delivery.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        delivery.busy = false;
                        return;
                    }
                }
            };
            let subscribers = self.subscribers.read().unwrap().clone();
            for entry in subscribers {
                (entry.callback)(&next);
            }
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().unwrap().push(SubscriberEntry {
            id,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap();
        let before = subscribers.len();
        subscribers.retain(|entry| entry.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

impl OrderedBroadcaster<ActionContext> {
    /// Subscribe to the envelopes accepted by `filter`.
    pub fn subscribe_matching<F>(&self, filter: ActionFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&ActionContext) + Send + Sync + 'static,
    {
        self.subscribe(move |ctx| {
            if filter.matches(ctx) {
                callback(ctx);
            }
        })
    }
}

impl<T> Default for OrderedBroadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
