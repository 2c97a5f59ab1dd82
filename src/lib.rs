//! Fluxstore — reactive single-tree state management.
//!
//! One immutable state tree per [`Store`]. State slices are declared with
//! [`StateBuilder`], composed into a tree by dotted path, and changed only
//! by dispatching actions through a plugin chain to the slices' handlers.
//!
//! # Lifecycle of a dispatch
//!
//! Every dispatched action instance is announced on the public action
//! stream as `Dispatched`, then exactly one of `Successful`, `Canceled` or
//! `Errored`. Statuses are delivered in FIFO order even when handlers
//! dispatch further actions synchronously.
//!
//! # Structural sharing
//!
//! Writes replace the target slice and its ancestors. Every other subtree
//! keeps its identity, so [`StateValue::ptr_eq`] is enough for selectors to
//! tell whether their inputs changed.
//!
//! # Example
//!
//! ```ignore
//! use openerp_fluxstore::{StateBuilder, Store, StoreConfig, TypedAction};
//!
//! #[derive(Debug)]
//! struct AddItem(String);
//! impl TypedAction for AddItem {
//!     const TYPE: &'static str = "[Cart] Add item";
//! }
//!
//! #[derive(Default)]
//! struct CartState;
//!
//! let cart = StateBuilder::<CartState>::new("cart")
//!     .defaults(json!({"items": []}))
//!     .on::<AddItem, _, _>("add_item", |_, ctx, action| {
//!         let mut items = ctx.get_state().get("items").cloned().unwrap_or_default();
//!         items.push(action.0.as_str())?;
//!         ctx.patch_state(StateValue::map().with("items", items))
//!     })
//!     .build()?;
//!
//! let store = Store::new(&[cart], StoreConfig::default())?;
//! store.dispatch(AddItem("x".into())).await?;
//! ```

pub mod action;
pub mod actions_stream;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod operations;
pub mod path;
pub mod plugin;
pub mod selector;
pub mod state_factory;
pub mod store;
pub mod stream;
pub mod value;

// Re-export primary types at crate root.
pub use action::{
    Action, ActionContext, ActionFilter, ActionRef, ActionStatus, DynAction, InitState, IntoAction,
    TypedAction, UpdateState, action_matcher,
};
pub use actions_stream::{ActionStream, OrderedBroadcaster};
pub use config::{StoreConfig, StoreOptions};
pub use context::{StateContext, StateContextFactory};
pub use dispatcher::{DispatchHandle, Dispatcher};
pub use error::{StoreError, error_code};
pub use metadata::{
    FactoryInjector, Handled, HandlerOptions, Injector, IntoHandled, StateBuilder, StateDescriptor,
    StateType, ensure_metadata, get_metadata,
};
pub use path::{get_at, set_at};
pub use plugin::{DispatchResult, NextFn, Plugin, PluginManager, PluginOutput};
pub use selector::{
    MemoizedFn, Selector, SelectorFn, SelectorRef, create_selector, memoize, resolve_selector_fn,
};
pub use state_factory::{MappedState, StateFactory};
pub use store::{Selection, Store};
pub use value::{StateMap, StateValue, SubscriptionId};
