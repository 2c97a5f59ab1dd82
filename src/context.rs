use std::sync::Arc;

use crate::action::{ActionRef, IntoAction};
use crate::dispatcher::DispatchHandle;
use crate::error::StoreError;
use crate::operations::StateOperations;
use crate::path::{get_at, set_at};
use crate::value::StateValue;

/// Handle on one slice of the state tree, given to action handlers and
/// init hooks.
///
/// All writes go through the root operations, so every write replaces the
/// slice and its ancestors and leaves sibling slices shared.
#[derive(Clone)]
pub struct StateContext {
    ops: Arc<dyn StateOperations>,
    path: Arc<str>,
    // keys of registered child slices nested under this one
    children: Arc<[String]>,
}

impl StateContext {
    pub fn new(ops: Arc<dyn StateOperations>, path: &str) -> Self {
        Self::with_children(ops, path, Vec::new())
    }

    /// A context whose slice holds the registered child slices `children`.
    pub fn with_children(ops: Arc<dyn StateOperations>, path: &str, children: Vec<String>) -> Self {
        Self {
            ops,
            path: Arc::from(path),
            children: children.into(),
        }
    }

    /// Dotted path of the slice.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current slice value; `Null` when the slice does not exist yet.
    pub fn get_state(&self) -> StateValue {
        get_at(&self.ops.get_state(), &self.path).unwrap_or_default()
    }

    /// Replace the slice and return the new whole tree.
    ///
    /// When both the old and the new slice are maps, registered child slices
    /// missing from the new value are carried over unchanged.
    pub fn set_state(&self, value: impl Into<StateValue>) -> StateValue {
        let root = self.ops.get_state();
        let value = self.keep_children(&root, value.into());
        self.ops.set_state(set_at(&root, &self.path, value))
    }

    fn keep_children(&self, root: &StateValue, value: StateValue) -> StateValue {
        if self.children.is_empty() {
            return value;
        }
        let Some(next) = value.as_map() else {
            return value;
        };
        let current = get_at(root, &self.path).unwrap_or_default();
        let Some(current) = current.as_map() else {
            return value;
        };
        let kept: Vec<(String, StateValue)> = self
            .children
            .iter()
            .filter(|key| !next.contains_key(key.as_str()))
            .filter_map(|key| current.get(key).map(|child| (key.clone(), child.clone())))
            .collect();
        if kept.is_empty() {
            return value;
        }
        let mut merged = next.clone();
        merged.extend(kept);
        StateValue::from(merged)
    }

    /// Shallow-merge `partial` onto the slice and return the new whole tree.
    ///
    /// Only maps can be patched; lists and primitives (including `Null`) are
    /// rejected with `UnsupportedOperation`. A slice that is not a map yet
    /// is patched as if it were empty.
    pub fn patch_state(&self, partial: impl Into<StateValue>) -> Result<StateValue, StoreError> {
        let partial = partial.into();
        let Some(patch) = partial.as_map() else {
            return Err(StoreError::UnsupportedOperation(format!(
                "patching a {} is not supported",
                partial.kind()
            )));
        };
        let mut merged = self.get_state().as_map().cloned().unwrap_or_default();
        merged.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(self.set_state(merged))
    }

    pub fn dispatch(&self, action: impl IntoAction) -> DispatchHandle {
        self.ops.dispatch(action.into_action())
    }

    pub fn dispatch_all(&self, actions: Vec<ActionRef>) -> DispatchHandle {
        self.ops.dispatch_all(actions)
    }
}

impl std::fmt::Debug for StateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("path", &self.path)
            .field("children", &self.children)
            .finish()
    }
}

/// Builds state contexts on one set of root operations.
#[derive(Clone)]
pub struct StateContextFactory {
    ops: Arc<dyn StateOperations>,
}

impl StateContextFactory {
    pub fn new(ops: Arc<dyn StateOperations>) -> Self {
        Self { ops }
    }

    pub fn create(&self, path: &str) -> StateContext {
        StateContext::new(self.ops.clone(), path)
    }

    /// A context for a slice that holds registered child slices.
    pub fn create_with_children(&self, path: &str, children: Vec<String>) -> StateContext {
        StateContext::with_children(self.ops.clone(), path, children)
    }

    pub fn operations(&self) -> &Arc<dyn StateOperations> {
        &self.ops
    }
}
