//! Composition engine: registration of descriptor sets, default merging,
//! and the wiring from `Dispatched` envelopes to action handlers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Either, FutureExt};
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use crate::action::{ActionContext, ActionRef, ActionStatus};
use crate::actions_stream::ActionStream;
use crate::config::Spawner;
use crate::context::{StateContext, StateContextFactory};
use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::graph::{build_graph, compute_paths, topo_sort};
use crate::metadata::{ActionHandlerEntry, Handled, Injector, Instance, StateDescriptor};
use crate::path::{get_at, set_at};
use crate::value::StateValue;

/// A registered state slice of one composition root.
#[derive(Clone)]
pub struct MappedState {
    pub name: String,
    /// Dotted position in the tree.
    pub path: String,
    pub descriptor: StateDescriptor,
    /// Private copy of the declared defaults.
    pub defaults: StateValue,
    /// Handler-bearing object.
    pub instance: Instance,
}

impl std::fmt::Debug for MappedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedState")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

struct FactoryInner {
    states: Arc<RwLock<Vec<MappedState>>>,
    connected: Arc<AtomicBool>,
    parent: Option<StateFactory>,
    contexts: StateContextFactory,
    actions: Arc<ActionStream>,
    results: Arc<ActionStream>,
    spawner: Spawner,
    injector: Arc<dyn Injector>,
}

/// Registry of the state slices of one composition root.
///
/// Child factories (feature registrations) share the root's list of
/// states, so a name is only ever registered once per root.
#[derive(Clone)]
pub struct StateFactory {
    inner: Arc<FactoryInner>,
}

/// Resolves to `true` when the handlers produced a completion, `false`
/// when they were canceled without producing one.
type Completion = BoxFuture<'static, Result<bool, StoreError>>;

impl StateFactory {
    pub fn new(
        dispatcher: &Dispatcher,
        contexts: StateContextFactory,
        injector: Arc<dyn Injector>,
    ) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                states: Arc::new(RwLock::new(Vec::new())),
                connected: Arc::new(AtomicBool::new(false)),
                parent: None,
                contexts,
                actions: dispatcher.actions().clone(),
                results: dispatcher.results().clone(),
                spawner: dispatcher.spawner().clone(),
                injector,
            }),
        }
    }

    /// A factory for a feature registration on the same root.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                states: self.inner.states.clone(),
                connected: self.inner.connected.clone(),
                parent: Some(self.clone()),
                contexts: self.inner.contexts.clone(),
                actions: self.inner.actions.clone(),
                results: self.inner.results.clone(),
                spawner: self.inner.spawner.clone(),
                injector: self.inner.injector.clone(),
            }),
        }
    }

    pub fn parent(&self) -> Option<&StateFactory> {
        self.inner.parent.as_ref()
    }

    /// Registered states, in registration order.
    pub fn states(&self) -> Vec<MappedState> {
        self.inner.states.read().unwrap().clone()
    }

    pub fn contexts(&self) -> &StateContextFactory {
        &self.inner.contexts
    }

    // ====================================================================
    // Registration
    // ====================================================================

    /// Register a set of descriptors and return the newly added states.
    ///
    /// Children are registered before their parents. Names already known
    /// to this root are skipped. On error, the states appended before the
    /// failing one stay registered.
    pub fn register(
        &self,
        descriptors: &[StateDescriptor],
    ) -> Result<Vec<MappedState>, StoreError> {
        let graph = build_graph(descriptors)?;
        let order = topo_sort(&graph)?;
        let paths = compute_paths(&graph);

        let known: HashSet<String> = self
            .inner
            .states
            .read()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();

        let mut added = Vec::new();
        for name in order {
            if known.contains(&name) {
                debug!(state = %name, "state already registered, skipping");
                continue;
            }
            let (Some(descriptor), Some(path)) = (graph.descriptor(&name), paths.get(&name)) else {
                continue;
            };
            let instance = self.inner.injector.instantiate(descriptor)?;
            if (*instance).type_id() != descriptor.state_type() {
                return Err(StoreError::Configuration(format!(
                    "instance supplied for state '{name}' is not a {}",
                    descriptor.type_name()
                )));
            }

            descriptor.set_path(path);
            let state = MappedState {
                name: name.clone(),
                path: path.clone(),
                descriptor: descriptor.clone(),
                defaults: descriptor.clone_defaults(),
                instance,
            };
            self.inner.states.write().unwrap().push(state.clone());
            debug!(state = %name, path = %path, "state registered");
            added.push(state);
        }
        Ok(added)
    }

    /// Register, then fold the new states' defaults into one tree.
    pub fn register_and_compute_defaults(
        &self,
        descriptors: &[StateDescriptor],
    ) -> Result<(StateValue, Vec<MappedState>), StoreError> {
        let added = self.register(descriptors)?;
        let defaults = added.iter().fold(StateValue::map(), |tree, state| {
            place_default(&tree, &state.path, state.defaults.clone())
        });
        Ok((defaults, added))
    }

    // ====================================================================
    // Handler wiring
    // ====================================================================

    /// Route `Dispatched` envelopes to handlers and report the outcome on
    /// the result stream. Only the first call per root has an effect.
    pub fn connect(&self) {
        if self.inner.connected.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.actions.subscribe(move |ctx: &ActionContext| {
            if ctx.status != ActionStatus::Dispatched {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let factory = StateFactory { inner };
            let action = ctx.action.clone();
            let completion = factory.invoke_handlers(&action);
            let results = factory.inner.results.clone();
            let report = async move {
                let envelope = match completion.await {
                    Ok(true) => ActionContext::successful(action),
                    Ok(false) => ActionContext::canceled(action),
                    Err(err) => {
                        debug!(action = action.action_type(), error = %err, "action errored");
                        ActionContext::errored(action, err)
                    }
                };
                results.publish(envelope);
            }
            .boxed();
            run_or_spawn(report, &factory.inner.spawner);
        });
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Run every handler registered for `action`'s type, across all states,
    /// concurrently.
    ///
    /// Resolves once every handler finished. The first failure (in
    /// completion order) fails the whole call; otherwise the result is
    /// `false` if any handler was canceled before completing.
    pub fn invoke_handlers(&self, action: &ActionRef) -> Completion {
        let states = self.states();
        let pending: FuturesUnordered<Completion> = FuturesUnordered::new();

        for state in &states {
            let Some(entries) = state.descriptor.handlers().get(action.action_type()) else {
                continue;
            };
            for entry in entries {
                pending.push(self.invoke_entry(state, entry, action));
            }
        }

        if pending.is_empty() {
            return future::ready(Ok(true)).boxed();
        }

        async move {
            let outcomes: Vec<Result<bool, StoreError>> = pending.collect().await;
            let mut completed = true;
            for outcome in outcomes {
                completed &= outcome?;
            }
            Ok(completed)
        }
        .boxed()
    }

    fn invoke_entry(
        &self,
        state: &MappedState,
        entry: &ActionHandlerEntry,
        action: &ActionRef,
    ) -> Completion {
        let ctx = self.context_for(state);
        let action_type = action.action_type().to_string();

        let emissions: BoxStream<'static, anyhow::Result<()>> =
            match entry.invoke(state.instance.as_ref(), &ctx, action) {
                Err(err) => {
                    return future::ready(Err(StoreError::dispatch(action_type, err))).boxed();
                }
                Ok(Handled::Done) => return future::ready(Ok(true)).boxed(),
                Ok(Handled::Async(fut)) => stream::once(fut).boxed(),
                Ok(Handled::Stream(s)) => s,
            };

        let emitted = Arc::new(AtomicBool::new(false));
        let work = drain(emissions, emitted.clone(), action_type.clone());
        if !entry.options.cancel_uncompleted {
            return work.boxed();
        }

        let (stop, subscription) = self.cancel_signal(action);
        let actions = Arc::downgrade(&self.inner.actions);
        let handler_name = entry.handler_name.clone();
        async move {
            let outcome = match future::select(work.boxed(), stop).await {
                Either::Left((outcome, _)) => outcome,
                Either::Right(_) => {
                    debug!(
                        action = %action_type,
                        handler = %handler_name,
                        "handler canceled by a newer dispatch"
                    );
                    Ok(emitted.load(Ordering::Acquire))
                }
            };
            unsubscribe(&actions, subscription);
            outcome
        }
        .boxed()
    }

    /// Fires when another action of the same type is dispatched.
    fn cancel_signal(
        &self,
        action: &ActionRef,
    ) -> (oneshot::Receiver<()>, crate::value::SubscriptionId) {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let action_type = action.action_type().to_string();
        let this = action.clone();
        let id = self.inner.actions.subscribe(move |ctx: &ActionContext| {
            if ctx.status == ActionStatus::Dispatched
                && ctx.action.action_type() == action_type
                && !ctx.is_for(&this)
            {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        });
        (rx, id)
    }

    // ====================================================================
    // Lifecycle
    // ====================================================================

    /// Context for `state`, aware of the registered slices nested in it.
    fn context_for(&self, state: &MappedState) -> StateContext {
        let children = child_keys(&self.inner.states.read().unwrap(), &state.path);
        self.inner.contexts.create_with_children(&state.path, children)
    }

    /// Run the init hooks of `states`, in the given order.
    pub fn invoke_init(&self, states: &[MappedState]) {
        for state in states {
            let ctx = self.context_for(state);
            if let Some(Err(err)) = state.descriptor.run_init(state.instance.as_ref(), &ctx) {
                warn!(state = %state.name, error = %err, "init hook failed");
            }
        }
    }
}

/// Keys of the registered states placed directly under `path`.
fn child_keys(states: &[MappedState], path: &str) -> Vec<String> {
    let prefix = format!("{path}.");
    states
        .iter()
        .filter_map(|state| state.path.strip_prefix(prefix.as_str()))
        .filter(|rest| !rest.contains('.'))
        .map(str::to_string)
        .collect()
}

async fn drain(
    mut emissions: BoxStream<'static, anyhow::Result<()>>,
    emitted: Arc<AtomicBool>,
    action_type: String,
) -> Result<bool, StoreError> {
    while let Some(item) = emissions.next().await {
        item.map_err(|err| StoreError::dispatch(action_type.clone(), err))?;
        emitted.store(true, Ordering::Release);
    }
    Ok(emitted.load(Ordering::Acquire))
}

fn unsubscribe(actions: &Weak<ActionStream>, id: crate::value::SubscriptionId) {
    if let Some(actions) = actions.upgrade() {
        actions.unsubscribe(id);
    }
}

/// Finish `task` on the spot when it is already complete, else hand it to
/// the spawner.
pub(crate) fn run_or_spawn(mut task: BoxFuture<'static, ()>, spawner: &Spawner) {
    if (&mut task).now_or_never().is_none() {
        spawner(task);
    }
}

/// Put a state's default at `path`, keeping slices already placed there by
/// its children.
fn place_default(tree: &StateValue, path: &str, default: StateValue) -> StateValue {
    let placed = match (get_at(tree, path), default.as_map()) {
        (Some(existing), Some(own)) if existing.is_map() => {
            let mut merged = own.clone();
            if let Some(children) = existing.as_map() {
                merged.extend(children.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            StateValue::from(merged)
        }
        _ => default,
    };
    set_at(tree, path, placed)
}

/// Merge `defaults` into `current`: maps merge recursively, existing
/// values win, missing keys are added.
pub(crate) fn merge_defaults(current: &StateValue, defaults: &StateValue) -> StateValue {
    match (current.as_map(), defaults.as_map()) {
        (Some(cur), Some(def)) => {
            let mut merged = cur.clone();
            for (key, value) in def {
                let next = match cur.get(key) {
                    Some(existing) => merge_defaults(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            StateValue::from(merged)
        }
        _ if current.is_null() => defaults.clone(),
        _ => current.clone(),
    }
}
