use std::sync::Arc;

use crate::action::ActionRef;
use crate::dispatcher::{DispatchHandle, Dispatcher};
use crate::value::StateValue;

/// Whole-tree operations that every state context is scoped on top of.
pub trait StateOperations: Send + Sync {
    fn get_state(&self) -> StateValue;

    /// Publish `tree` as the new application state and return it.
    fn set_state(&self, tree: StateValue) -> StateValue;

    fn dispatch(&self, action: ActionRef) -> DispatchHandle;

    fn dispatch_all(&self, actions: Vec<ActionRef>) -> DispatchHandle;
}

/// Operations backed directly by the dispatcher and its state stream.
pub struct RootOperations {
    dispatcher: Arc<Dispatcher>,
}

impl RootOperations {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl StateOperations for RootOperations {
    fn get_state(&self) -> StateValue {
        self.dispatcher.state().current()
    }

    fn set_state(&self, tree: StateValue) -> StateValue {
        self.dispatcher.state().publish(tree.clone());
        tree
    }

    fn dispatch(&self, action: ActionRef) -> DispatchHandle {
        self.dispatcher.dispatch(action)
    }

    fn dispatch_all(&self, actions: Vec<ActionRef>) -> DispatchHandle {
        self.dispatcher.dispatch_all(actions)
    }
}

/// Development-mode wrapper: every tree passed to `set_state` is
/// deep-frozen before it is published. Reads pass through.
pub struct ImmutableOperations<O> {
    inner: O,
}

impl<O: StateOperations> ImmutableOperations<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O: StateOperations> StateOperations for ImmutableOperations<O> {
    fn get_state(&self) -> StateValue {
        self.inner.get_state()
    }

    fn set_state(&self, tree: StateValue) -> StateValue {
        tree.deep_freeze();
        self.inner.set_state(tree)
    }

    fn dispatch(&self, action: ActionRef) -> DispatchHandle {
        self.inner.dispatch(action)
    }

    fn dispatch_all(&self, actions: Vec<ActionRef>) -> DispatchHandle {
        self.inner.dispatch_all(actions)
    }
}

/// Root operations for one dispatcher, frozen in development mode.
pub fn root_operations(
    dispatcher: Arc<Dispatcher>,
    development_mode: bool,
) -> Arc<dyn StateOperations> {
    let root = RootOperations::new(dispatcher);
    if development_mode {
        Arc::new(ImmutableOperations::new(root))
    } else {
        Arc::new(root)
    }
}
