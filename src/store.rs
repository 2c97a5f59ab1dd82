use std::sync::{Arc, Mutex};

use futures::FutureExt;

use crate::action::{ActionRef, InitState, IntoAction, UpdateState};
use crate::actions_stream::ActionStream;
use crate::config::StoreConfig;
use crate::context::StateContextFactory;
use crate::dispatcher::{DispatchHandle, Dispatcher};
use crate::error::StoreError;
use crate::metadata::StateDescriptor;
use crate::operations::root_operations;
use crate::plugin::{Plugin, PluginManager};
use crate::selector::{SelectorRef, read, resolve_selector_fn};
use crate::state_factory::{MappedState, StateFactory, merge_defaults, run_or_spawn};
use crate::stream::StateStream;
use crate::value::{StateValue, SubscriptionId};

/// A composition root: one state tree, one dispatch pipeline, and the
/// states registered on it.
///
/// # Examples
///
/// ```ignore
/// let store = Store::new(&[ensure_metadata::<CartState>()?], StoreConfig::default())?;
///
/// store.select("cart.items", |items| println!("items: {items:?}"));
/// store.dispatch(AddItem("x")).await?;
///
/// assert_eq!(store.snapshot().to_json(), json!({"cart": {"items": ["x"]}}));
/// ```
pub struct Store {
    state: Arc<StateStream>,
    dispatcher: Arc<Dispatcher>,
    plugins: PluginManager,
    contexts: StateContextFactory,
    factory: StateFactory,
}

/// What a live selection delivers: the value, `None` for a missing path,
/// or the selector's error.
pub type Selection = Result<Option<StateValue>, StoreError>;

impl Store {
    /// Build the root, register `states`, merge their defaults, and
    /// dispatch `@@INIT`. Init hooks run once that dispatch succeeds.
    pub fn new(states: &[StateDescriptor], config: StoreConfig) -> Result<Self, StoreError> {
        let state = Arc::new(StateStream::new());
        let plugins = PluginManager::new(config.plugins.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            state.clone(),
            Arc::new(ActionStream::new()),
            Arc::new(ActionStream::new()),
            plugins.clone(),
            &config,
        ));
        let ops = root_operations(dispatcher.clone(), config.development_mode);
        let contexts = StateContextFactory::new(ops);
        let factory = StateFactory::new(&dispatcher, contexts.clone(), config.injector.clone());

        let store = Self {
            state,
            dispatcher,
            plugins,
            contexts,
            factory,
        };
        store.bootstrap(&store.factory, states, Arc::new(InitState))?;
        Ok(store)
    }

    /// Register more states on this root and append `plugins` to its
    /// chain. Dispatches `@@UPDATE_STATE`; the new states' init hooks run
    /// once it succeeds. Returns the states that were not registered yet.
    pub fn add_feature(
        &self,
        states: &[StateDescriptor],
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Vec<MappedState>, StoreError> {
        if !plugins.is_empty() {
            self.plugins.child(plugins);
        }
        self.bootstrap(&self.factory.child(), states, Arc::new(UpdateState))
    }

    fn bootstrap(
        &self,
        factory: &StateFactory,
        states: &[StateDescriptor],
        lifecycle: ActionRef,
    ) -> Result<Vec<MappedState>, StoreError> {
        let (defaults, added) = factory.register_and_compute_defaults(states)?;
        let ops = self.contexts.operations();
        ops.set_state(merge_defaults(&ops.get_state(), &defaults));
        factory.connect();

        let handle = self.dispatcher.dispatch(lifecycle);
        let factory = factory.clone();
        let fresh = added.clone();
        let init = async move {
            if let Ok(Some(_)) = handle.await {
                factory.invoke_init(&fresh);
            }
        };
        run_or_spawn(init.boxed(), self.dispatcher.spawner());
        Ok(added)
    }

    // ====================================================================
    // Dispatch
    // ====================================================================

    pub fn dispatch(&self, action: impl IntoAction) -> DispatchHandle {
        self.dispatcher.dispatch(action.into_action())
    }

    /// Dispatch several actions as one call. A failure reaches the error
    /// hook once for the whole batch.
    pub fn dispatch_all(&self, actions: Vec<ActionRef>) -> DispatchHandle {
        self.dispatcher.dispatch_all(actions)
    }

    /// The public `{action, status}` stream.
    pub fn actions(&self) -> &Arc<ActionStream> {
        self.dispatcher.actions()
    }

    // ====================================================================
    // State
    // ====================================================================

    pub fn snapshot(&self) -> StateValue {
        self.state.current()
    }

    /// Replace the whole tree without dispatching.
    pub fn reset(&self, tree: impl Into<StateValue>) {
        self.contexts.operations().set_state(tree.into());
    }

    /// Observe every published tree. The current tree is delivered
    /// immediately.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateValue) + Send + Sync + 'static,
    {
        self.state.subscribe(listener)
    }

    /// Stop a [`subscribe`](Self::subscribe) or [`select`](Self::select)
    /// listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    /// States registered on this root, in registration order.
    pub fn states(&self) -> Vec<MappedState> {
        self.factory.states()
    }

    // ====================================================================
    // Selection
    // ====================================================================

    /// Read a selection from the current tree.
    pub fn select_snapshot(&self, selector: impl Into<SelectorRef>) -> Selection {
        read(&resolve_selector_fn(&selector.into()), &self.state.current())
    }

    /// Observe a selection. The listener runs with the current selection,
    /// then again whenever it changes by reference. Errors are always
    /// delivered.
    pub fn select<F>(&self, selector: impl Into<SelectorRef>, listener: F) -> SubscriptionId
    where
        F: Fn(Selection) + Send + Sync + 'static,
    {
        let reader = resolve_selector_fn(&selector.into());
        let last: Mutex<Option<Option<StateValue>>> = Mutex::new(None);
        self.state.subscribe(move |tree: &StateValue| {
            let value = match read(&reader, tree) {
                Ok(value) => value,
                Err(err) => return listener(Err(err)),
            };
            {
                let mut last = last.lock().unwrap();
                if matches!(&*last, Some(prev) if same_selection(prev, &value)) {
                    return;
                }
                *last = Some(value.clone());
            }
            listener(Ok(value));
        })
    }
}

fn same_selection(prev: &Option<StateValue>, next: &Option<StateValue>) -> bool {
    match (prev, next) {
        (None, None) => true,
        (Some(a), Some(b)) => a.ptr_eq(b),
        _ => false,
    }
}
