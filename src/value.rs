use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;

use crate::error::StoreError;

/// Ordered key → value mapping used for every map node of the tree.
pub type StateMap = BTreeMap<String, StateValue>;

/// A shared container node of the state tree.
///
/// The `frozen` flag lives inside the allocation, so freezing a published
/// tree flips flags in place and never changes reference identity.
pub struct Node<T> {
    frozen: AtomicBool,
    data: T,
}

impl<T> Node<T> {
    fn new(data: T) -> Self {
        Self {
            frozen: AtomicBool::new(false),
            data,
        }
    }

    /// Whether this node was published by a development-mode store.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl<T> Deref for Node<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

/// Copies are never frozen: a copy is a new value nobody has published yet.
impl<T: Clone> Clone for Node<T> {
    fn clone(&self) -> Self {
        Node::new(self.data.clone())
    }
}

/// A node of the application state tree.
///
/// Containers and opaque values are reference-counted, so `clone` is an
/// atomic increment and unchanged branches are shared between successive
/// trees. [`StateValue::ptr_eq`] is the identity check the store relies on:
/// containers compare by reference, scalars by value.
///
/// A missing value is `Option::None` at the API surface; `Null` is an
/// explicit value.
#[derive(Clone)]
pub enum StateValue {
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    List(Arc<Node<Vec<StateValue>>>),
    Map(Arc<Node<StateMap>>),
    /// Any `Send + Sync` Rust value, shared as-is and compared by reference.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl StateValue {
    /// An empty map node.
    pub fn map() -> Self {
        StateValue::Map(Arc::new(Node::new(StateMap::new())))
    }

    /// An empty list node.
    pub fn list() -> Self {
        StateValue::List(Arc::new(Node::new(Vec::new())))
    }

    /// Wrap an arbitrary Rust value.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        StateValue::Opaque(Arc::new(value))
    }

    /// Short name of the variant, for messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Number(_) => "number",
            StateValue::String(_) => "string",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
            StateValue::Opaque(_) => "opaque",
        }
    }

    // ====================================================================
    // Identity
    // ====================================================================

    /// Reference identity: the same allocation for containers and opaque
    /// values, equal values for scalars.
    pub fn ptr_eq(&self, other: &StateValue) -> bool {
        match (self, other) {
            (StateValue::Null, StateValue::Null) => true,
            (StateValue::Bool(a), StateValue::Bool(b)) => a == b,
            (StateValue::Number(a), StateValue::Number(b)) => a == b,
            (StateValue::String(a), StateValue::String(b)) => a == b,
            (StateValue::List(a), StateValue::List(b)) => Arc::ptr_eq(a, b),
            (StateValue::Map(a), StateValue::Map(b)) => Arc::ptr_eq(a, b),
            (StateValue::Opaque(a), StateValue::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Number of strong references to the underlying container.
    ///
    /// Scalars report 1. Useful for verifying sharing in tests.
    pub fn ref_count(&self) -> usize {
        match self {
            StateValue::List(node) => Arc::strong_count(node),
            StateValue::Map(node) => Arc::strong_count(node),
            StateValue::Opaque(inner) => Arc::strong_count(inner),
            StateValue::String(s) => Arc::strong_count(s),
            _ => 1,
        }
    }

    // ====================================================================
    // Accessors
    // ====================================================================

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, StateValue::Map(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, StateValue::List(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            StateValue::Map(node) => Some(&node.data),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(node) => Some(&node.data),
            _ => None,
        }
    }

    /// Try to downcast an opaque value to a concrete type reference.
    ///
    /// Returns `None` for non-opaque values or a mismatched type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            StateValue::Opaque(inner) => inner.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Child by map key, or by list index when `key` parses as one.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        match self {
            StateValue::Map(node) => node.data.get(key),
            StateValue::List(node) => key.parse::<usize>().ok().and_then(|i| node.data.get(i)),
            _ => None,
        }
    }

    /// Like [`get`](Self::get), but a missing child is an error.
    ///
    /// This is the accessor for selector projectors: a `MissingPath` raised
    /// inside a selector makes the whole selection `None`.
    pub fn field(&self, key: &str) -> Result<&StateValue, StoreError> {
        self.get(key)
            .ok_or_else(|| StoreError::MissingPath(key.to_string()))
    }

    // ====================================================================
    // Building new values
    // ====================================================================

    /// A new map equal to this one with `key` set to `value`.
    ///
    /// The receiver is untouched (and may be frozen). Non-map receivers
    /// produce a single-entry map.
    pub fn with(&self, key: impl Into<String>, value: impl Into<StateValue>) -> StateValue {
        let mut map = self.as_map().cloned().unwrap_or_default();
        map.insert(key.into(), value.into());
        StateValue::from(map)
    }

    /// Insert into a map in place (copy-on-write when shared).
    ///
    /// Fails with `FrozenState` on a value published in development mode.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<StateValue>,
    ) -> Result<Option<StateValue>, StoreError> {
        let kind = self.kind();
        match self {
            StateValue::Map(node) => Ok(make_mut(node, "map")?.insert(key.into(), value.into())),
            _ => Err(StoreError::UnsupportedOperation(format!(
                "cannot insert a key into a {kind}"
            ))),
        }
    }

    /// Remove a key from a map in place (copy-on-write when shared).
    pub fn remove(&mut self, key: &str) -> Result<Option<StateValue>, StoreError> {
        let kind = self.kind();
        match self {
            StateValue::Map(node) => Ok(make_mut(node, "map")?.remove(key)),
            _ => Err(StoreError::UnsupportedOperation(format!(
                "cannot remove a key from a {kind}"
            ))),
        }
    }

    /// Append to a list in place (copy-on-write when shared).
    pub fn push(&mut self, value: impl Into<StateValue>) -> Result<(), StoreError> {
        let kind = self.kind();
        match self {
            StateValue::List(node) => {
                make_mut(node, "list")?.push(value.into());
                Ok(())
            }
            _ => Err(StoreError::UnsupportedOperation(format!("cannot push onto a {kind}"))),
        }
    }

    // ====================================================================
    // Freezing
    // ====================================================================

    /// Whether this container was frozen. Scalars are always immutable.
    pub fn is_frozen(&self) -> bool {
        match self {
            StateValue::List(node) => node.is_frozen(),
            StateValue::Map(node) => node.is_frozen(),
            _ => true,
        }
    }

    /// Freeze every container reachable from this value, in place.
    ///
    /// Already-frozen branches are skipped, so re-freezing a tree that
    /// shares most of its nodes with a previously frozen one only visits
    /// the new nodes.
    pub fn deep_freeze(&self) {
        match self {
            StateValue::List(node) => {
                if !node.frozen.swap(true, Ordering::AcqRel) {
                    node.data.iter().for_each(StateValue::deep_freeze);
                }
            }
            StateValue::Map(node) => {
                if !node.frozen.swap(true, Ordering::AcqRel) {
                    node.data.values().for_each(StateValue::deep_freeze);
                }
            }
            _ => {}
        }
    }

    // ====================================================================
    // JSON interop
    // ====================================================================

    /// Convert to a `serde_json::Value`. Opaque values become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StateValue::Null | StateValue::Opaque(_) => serde_json::Value::Null,
            StateValue::Bool(b) => serde_json::Value::Bool(*b),
            StateValue::Number(n) => serde_json::Value::Number(n.clone()),
            StateValue::String(s) => serde_json::Value::String(s.to_string()),
            StateValue::List(node) => {
                serde_json::Value::Array(node.data.iter().map(StateValue::to_json).collect())
            }
            StateValue::Map(node) => serde_json::Value::Object(
                node.data
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn make_mut<'a, T: Clone>(node: &'a mut Arc<Node<T>>, what: &str) -> Result<&'a mut T, StoreError> {
    if node.is_frozen() {
        return Err(StoreError::FrozenState(format!("{what} was published as frozen")));
    }
    Ok(&mut Arc::make_mut(node).data)
}

impl Default for StateValue {
    fn default() -> Self {
        StateValue::Null
    }
}

/// Structural equality. Shared containers short-circuit on identity.
impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateValue::List(a), StateValue::List(b)) => {
                Arc::ptr_eq(a, b) || a.data == b.data
            }
            (StateValue::Map(a), StateValue::Map(b)) => Arc::ptr_eq(a, b) || a.data == b.data,
            _ => self.ptr_eq(other),
        }
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => f.write_str("null"),
            StateValue::Bool(b) => write!(f, "{b}"),
            StateValue::Number(n) => write!(f, "{n}"),
            StateValue::String(s) => write!(f, "{s:?}"),
            StateValue::List(node) => f.debug_list().entries(node.data.iter()).finish(),
            StateValue::Map(node) => f.debug_map().entries(node.data.iter()).finish(),
            StateValue::Opaque(inner) => f
                .debug_struct("Opaque")
                .field("type_id", &(**inner).type_id())
                .finish(),
        }
    }
}

// ── Conversions ──

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

macro_rules! from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for StateValue {
            fn from(n: $t) -> Self {
                StateValue::Number(Number::from(n))
            }
        })*
    };
}

from_integer!(i32, i64, u32, u64, usize);

impl From<f64> for StateValue {
    /// NaN and infinities have no JSON number form and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(StateValue::Null, StateValue::Number)
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::String(Arc::from(s))
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::String(Arc::from(s))
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(items: Vec<StateValue>) -> Self {
        StateValue::List(Arc::new(Node::new(items)))
    }
}

impl From<StateMap> for StateValue {
    fn from(map: StateMap) -> Self {
        StateValue::Map(Arc::new(Node::new(map)))
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StateValue::Null,
            serde_json::Value::Bool(b) => StateValue::Bool(b),
            serde_json::Value::Number(n) => StateValue::Number(n),
            serde_json::Value::String(s) => StateValue::from(s),
            serde_json::Value::Array(items) => {
                StateValue::from(items.into_iter().map(StateValue::from).collect::<Vec<_>>())
            }
            serde_json::Value::Object(entries) => StateValue::from(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, StateValue::from(v)))
                    .collect::<StateMap>(),
            ),
        }
    }
}

impl Serialize for StateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StateValue::Null | StateValue::Opaque(_) => serializer.serialize_unit(),
            StateValue::Bool(b) => serializer.serialize_bool(*b),
            StateValue::Number(n) => n.serialize(serializer),
            StateValue::String(s) => serializer.serialize_str(s),
            StateValue::List(node) => node.data.serialize(serializer),
            StateValue::Map(node) => node.data.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StateValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(StateValue::from)
    }
}

/// Unique handle for a subscription, returned by the `subscribe` methods
/// of the state stream, the action streams and the store.
///
/// Use this to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);
