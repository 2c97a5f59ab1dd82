use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::value::{StateValue, SubscriptionId};

/// Callback type for whole-tree notifications.
pub type StateListener = Arc<dyn Fn(&StateValue) + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: SubscriptionId,
    listener: StateListener,
    // highest publish sequence handed to this listener
    delivered: Arc<AtomicU64>,
}

impl ListenerEntry {
    /// Call the listener unless it already saw `seq` or a later tree.
    fn deliver(&self, seq: u64, tree: &StateValue) -> bool {
        if self.delivered.fetch_max(seq, Ordering::AcqRel) >= seq {
            return false;
        }
        (self.listener)(tree);
        true
    }
}

/// Hot, replay-latest holder of the application state tree.
///
/// - `current()` reads the tree (Arc clone, cheap).
/// - `publish(tree)` replaces it and notifies listeners in subscription order.
/// - `subscribe(listener)` delivers the current tree immediately, then every
///   later publish.
///
/// No lock is held while listeners run, so a listener may publish again.
/// Every publish carries a sequence number and a listener never receives a
/// tree older than one it was already given: a replay that loses a race
/// with a concurrent publish is dropped, as is the rest of an outer publish
/// once a listener has seen the tree published from inside another listener.
pub struct StateStream {
    current: RwLock<(u64, StateValue)>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

impl StateStream {
    /// A stream holding an empty map.
    pub fn new() -> Self {
        Self {
            // the initial tree is sequence 1; listeners start at 0
            current: RwLock::new((1, StateValue::map())),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> StateValue {
        self.current.read().unwrap().1.clone()
    }

    /// Replace the tree and notify every listener synchronously.
    pub fn publish(&self, tree: StateValue) {
        // lock order: listeners, then current
        let (seq, listeners) = {
            let listeners = self.listeners.read().unwrap();
            let mut current = self.current.write().unwrap();
            current.0 += 1;
            current.1 = tree.clone();
            (current.0, listeners.clone())
        };
        for entry in listeners {
            entry.deliver(seq, &tree);
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateValue) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = ListenerEntry {
            id,
            listener: Arc::new(listener),
            delivered: Arc::new(AtomicU64::new(0)),
        };
        let (seq, replay) = {
            let mut listeners = self.listeners.write().unwrap();
            listeners.push(entry.clone());
            self.current.read().unwrap().clone()
        };
        entry.deliver(seq, &replay);
        id
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }
}

impl Default for StateStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (
        Arc<Mutex<Vec<serde_json::Value>>>,
        impl Fn(&StateValue) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        (seen, move |v: &StateValue| seen_c.lock().unwrap().push(v.to_json()))
    }

    // ========================================================================
    // Current value
    // ========================================================================

    #[test]
    fn starts_with_empty_map() {
        let stream = StateStream::new();
        assert_eq!(stream.current().to_json(), json!({}));
    }

    #[test]
    fn publish_replaces_current() {
        let stream = StateStream::new();
        let tree = StateValue::from(json!({"a": 1}));
        stream.publish(tree.clone());
        assert!(stream.current().ptr_eq(&tree));
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    #[test]
    fn subscribe_replays_latest() {
        let stream = StateStream::new();
        stream.publish(StateValue::from(json!({"a": 1})));

        let (seen, listener) = recorder();
        stream.subscribe(listener);
        assert_eq!(*seen.lock().unwrap(), vec![json!({"a": 1})]);

        stream.publish(StateValue::from(json!({"a": 2})));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let stream = StateStream::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            stream.subscribe(move |_| order.lock().unwrap().push(tag));
        }
        order.lock().unwrap().clear();

        stream.publish(StateValue::map());
        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let stream = StateStream::new();
        let (seen, listener) = recorder();
        let id = stream.subscribe(listener);
        assert_eq!(stream.listener_count(), 1);

        assert!(stream.unsubscribe(id));
        assert!(!stream.unsubscribe(id));
        stream.publish(StateValue::from(json!({"late": true})));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn listener_may_publish() {
        let stream = Arc::new(StateStream::new());
        let inner = stream.clone();
        stream.subscribe(move |v| {
            if v.get("step").and_then(StateValue::as_i64) == Some(1) {
                inner.publish(StateValue::from(json!({"step": 2})));
            }
        });
        stream.publish(StateValue::from(json!({"step": 1})));
        assert_eq!(stream.current().to_json(), json!({"step": 2}));
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    #[test]
    fn stale_tree_is_not_delivered_after_newer_one() {
        let (seen, listener) = recorder();
        let entry = ListenerEntry {
            id: SubscriptionId(1),
            listener: Arc::new(listener),
            delivered: Arc::new(AtomicU64::new(0)),
        };

        assert!(entry.deliver(2, &StateValue::from(json!({"n": 2}))));
        // a replay read before publish #2 but handed over after it
        assert!(!entry.deliver(1, &StateValue::from(json!({"n": 1}))));
        assert!(entry.deliver(3, &StateValue::from(json!({"n": 3}))));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 2}), json!({"n": 3})]);
    }

    #[test]
    fn nested_publish_supersedes_outer_one() {
        let stream = Arc::new(StateStream::new());
        let inner = stream.clone();
        stream.subscribe(move |v| {
            if v.get("step").and_then(StateValue::as_i64) == Some(1) {
                inner.publish(StateValue::from(json!({"step": 2})));
            }
        });
        let (seen, listener) = recorder();
        stream.subscribe(listener);

        stream.publish(StateValue::from(json!({"step": 1})));
        assert_eq!(*seen.lock().unwrap(), vec![json!({}), json!({"step": 2})]);
    }

    #[test]
    fn concurrent_subscribers_see_increasing_trees() {
        let stream = Arc::new(StateStream::new());
        let publisher = {
            let stream = stream.clone();
            std::thread::spawn(move || {
                for n in 1..=200 {
                    stream.publish(StateValue::from(json!({"n": n})));
                }
            })
        };

        let mut logs = Vec::new();
        for _ in 0..20 {
            let log = Arc::new(Mutex::new(Vec::new()));
            let log_c = log.clone();
            stream.subscribe(move |v| {
                let n = v.get("n").and_then(StateValue::as_i64).unwrap_or(0);
                log_c.lock().unwrap().push(n);
            });
            logs.push(log);
        }
        publisher.join().unwrap();

        for log in logs {
            let log = log.lock().unwrap();
            assert!(log.windows(2).all(|w| w[0] < w[1]), "out of order: {log:?}");
            assert_eq!(log.last(), Some(&200));
        }
    }
}
