//! State descriptors and the per-type metadata registry.
//!
//! A [`StateDescriptor`] is the registration record of one state slice:
//! name, default value, child slices, action-handler table and the
//! handler-bearing type. Descriptors are produced by [`StateBuilder`],
//! either directly or through a [`StateType`] whose `define()` is run once
//! per process by [`ensure_metadata`].
//!
//! # Example
//!
//! ```ignore
//! #[derive(Default)]
//! struct CartState;
//!
//! impl StateType for CartState {
//!     fn define() -> StateBuilder<Self> {
//!         StateBuilder::new("cart")
//!             .defaults(json!({"items": []}))
//!             .child::<SavedState>()
//!             .on::<AddItem, _, _>("add_item", |_, ctx, action| {
//!                 ctx.set_state(json!({"items": [action.0.clone()]}))
//!             })
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use tracing::debug;

use crate::action::{ActionRef, TypedAction};
use crate::context::StateContext;
use crate::error::StoreError;
use crate::value::{StateMap, StateValue};

/// Shared, type-erased handler-bearing object.
pub type Instance = Arc<dyn Any + Send + Sync>;

type ErasedHandler = Arc<
    dyn Fn(&(dyn Any + Send + Sync), &StateContext, &ActionRef) -> anyhow::Result<Handled>
        + Send
        + Sync,
>;

type ErasedInit =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &StateContext) -> anyhow::Result<()> + Send + Sync>;

type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;

// ── Handler results ──

/// What an action handler hands back to the composition engine.
pub enum Handled {
    /// Finished synchronously.
    Done,
    /// Completes once the future resolves.
    Async(BoxFuture<'static, anyhow::Result<()>>),
    /// Completes when the stream ends. A stream that ends without yielding
    /// an item marks the action as canceled.
    Stream(BoxStream<'static, anyhow::Result<()>>),
}

impl Handled {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Handled::Async(future.boxed())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<()>> + Send + 'static,
    {
        Handled::Stream(stream.boxed())
    }
}

impl fmt::Debug for Handled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handled::Done => f.write_str("Done"),
            Handled::Async(_) => f.write_str("Async(..)"),
            Handled::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Return types accepted from action handlers.
pub trait IntoHandled {
    fn into_handled(self) -> anyhow::Result<Handled>;
}

impl IntoHandled for () {
    fn into_handled(self) -> anyhow::Result<Handled> {
        Ok(Handled::Done)
    }
}

impl IntoHandled for Handled {
    fn into_handled(self) -> anyhow::Result<Handled> {
        Ok(self)
    }
}

impl IntoHandled for StateValue {
    /// Handlers may return the tree produced by `set_state`/`patch_state`.
    fn into_handled(self) -> anyhow::Result<Handled> {
        Ok(Handled::Done)
    }
}

impl<T, E> IntoHandled for Result<T, E>
where
    T: IntoHandled,
    E: Into<anyhow::Error>,
{
    fn into_handled(self) -> anyhow::Result<Handled> {
        self.map_err(Into::into)?.into_handled()
    }
}

// ── Handler entries ──

/// Per-handler options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Cancel this handler's in-flight work when another action of the
    /// same type is dispatched.
    pub cancel_uncompleted: bool,
}

impl HandlerOptions {
    pub fn cancel_uncompleted() -> Self {
        Self {
            cancel_uncompleted: true,
        }
    }
}

/// One entry of a state's action-handler table.
#[derive(Clone)]
pub struct ActionHandlerEntry {
    pub handler_name: String,
    pub action_type: String,
    pub options: HandlerOptions,
    handler: ErasedHandler,
}

impl ActionHandlerEntry {
    /// Run the handler against a handler-bearing object.
    pub fn invoke(
        &self,
        instance: &(dyn Any + Send + Sync),
        ctx: &StateContext,
        action: &ActionRef,
    ) -> anyhow::Result<Handled> {
        (self.handler)(instance, ctx, action)
    }
}

impl fmt::Debug for ActionHandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandlerEntry")
            .field("handler_name", &self.handler_name)
            .field("action_type", &self.action_type)
            .field("options", &self.options)
            .finish()
    }
}

/// Action type → handler entries.
pub type HandlerTable = BTreeMap<String, Vec<ActionHandlerEntry>>;

// ── Children ──

#[derive(Clone)]
enum ChildRef {
    /// Resolved through the registry when the graph is built, so that
    /// mutually referencing types can be declared at all.
    Registered {
        type_name: &'static str,
        ensure: fn() -> Result<StateDescriptor, StoreError>,
    },
    Descriptor(StateDescriptor),
}

// ── StateDescriptor ──

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

struct DescriptorInner {
    id: u64,
    name: String,
    defaults: Option<StateValue>,
    children: Vec<ChildRef>,
    handlers: HandlerTable,
    init: Option<ErasedInit>,
    factory: Option<Factory>,
    state_type: TypeId,
    type_name: &'static str,
    path: RwLock<Option<String>>,
}

/// Registration record of one state slice. Cheap to clone.
#[derive(Clone)]
pub struct StateDescriptor {
    inner: Arc<DescriptorInner>,
}

impl StateDescriptor {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Dotted tree path, known once the descriptor was registered.
    pub fn path(&self) -> Option<String> {
        self.inner.path.read().unwrap().clone()
    }

    pub(crate) fn set_path(&self, path: &str) {
        *self.inner.path.write().unwrap() = Some(path.to_string());
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.inner.handlers
    }

    /// `TypeId` of the handler-bearing type.
    pub fn state_type(&self) -> TypeId {
        self.inner.state_type
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// The declared default value, unmodified. `None` when undeclared.
    pub fn defaults(&self) -> Option<&StateValue> {
        self.inner.defaults.as_ref()
    }

    /// A fresh copy of the default value for a new slice.
    ///
    /// Lists and maps get a new top-level node; other values are shared.
    /// An undeclared default becomes an empty map.
    pub fn clone_defaults(&self) -> StateValue {
        match &self.inner.defaults {
            None => StateValue::map(),
            Some(StateValue::Map(node)) => StateValue::from(StateMap::clone(node)),
            Some(StateValue::List(node)) => StateValue::from(Vec::<StateValue>::clone(node)),
            Some(other) => other.clone(),
        }
    }

    /// Resolve the declared children to descriptors.
    pub fn children(&self) -> Result<Vec<StateDescriptor>, StoreError> {
        self.inner
            .children
            .iter()
            .map(|child| match child {
                ChildRef::Descriptor(d) => Ok(d.clone()),
                ChildRef::Registered { type_name, ensure } => ensure().map_err(|err| {
                    StoreError::Configuration(format!(
                        "child '{type_name}' of state '{}' is not a valid state: {err}",
                        self.inner.name
                    ))
                }),
            })
            .collect()
    }

    /// Build a handler-bearing object with the recorded factory, if any.
    pub fn create_instance(&self) -> Option<Instance> {
        self.inner.factory.as_ref().map(|factory| factory())
    }

    /// Run the init hook, if the state declares one.
    pub(crate) fn run_init(
        &self,
        instance: &(dyn Any + Send + Sync),
        ctx: &StateContext,
    ) -> Option<anyhow::Result<()>> {
        self.inner.init.as_ref().map(|hook| hook(instance, ctx))
    }

    pub fn has_init(&self) -> bool {
        self.inner.init.is_some()
    }

    /// Identity of this registration record.
    pub fn ptr_eq(&self, other: &StateDescriptor) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for StateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("name", &self.inner.name)
            .field("type", &self.inner.type_name)
            .field("path", &self.path())
            .field("actions", &self.inner.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── StateBuilder ──

/// Builds a [`StateDescriptor`] for handler-bearing type `S`.
pub struct StateBuilder<S> {
    name: String,
    defaults: Option<StateValue>,
    children: Vec<ChildRef>,
    handlers: HandlerTable,
    inherited: HandlerTable,
    init: Option<ErasedInit>,
    inherited_init: Option<ErasedInit>,
    factory: Option<Factory>,
    error: Option<StoreError>,
    _state: std::marker::PhantomData<fn() -> S>,
}

impl<S: Any + Send + Sync + Default> StateBuilder<S> {
    /// Start a state whose handler-bearing object is `S::default()`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_factory(name, S::default)
    }
}

impl<S: Any + Send + Sync> StateBuilder<S> {
    /// Start a state whose handler-bearing object comes from `factory`.
    pub fn with_factory<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        let mut builder = Self::injected(name);
        builder.factory = Some(Arc::new(move || Arc::new(factory()) as Instance));
        builder
    }

    /// Start a state whose handler-bearing object must be supplied by the
    /// store's [`Injector`].
    pub fn injected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults: None,
            children: Vec::new(),
            handlers: HandlerTable::new(),
            inherited: HandlerTable::new(),
            init: None,
            inherited_init: None,
            factory: None,
            error: None,
            _state: std::marker::PhantomData,
        }
    }

    pub fn defaults(mut self, defaults: impl Into<StateValue>) -> Self {
        self.defaults = Some(defaults.into());
        self
    }

    /// Declare a child slice by its [`StateType`].
    pub fn child<C: StateType>(mut self) -> Self {
        self.children.push(ChildRef::Registered {
            type_name: std::any::type_name::<C>(),
            ensure: ensure_metadata::<C>,
        });
        self
    }

    /// Declare a child slice by an already built descriptor.
    pub fn child_descriptor(mut self, child: &StateDescriptor) -> Self {
        self.children.push(ChildRef::Descriptor(child.clone()));
        self
    }

    /// Handle typed action `A`.
    pub fn on<A, R, F>(self, handler_name: &str, handler: F) -> Self
    where
        A: TypedAction,
        R: IntoHandled,
        F: Fn(&S, &StateContext, &A) -> R + Send + Sync + 'static,
    {
        self.on_with(handler_name, HandlerOptions::default(), handler)
    }

    /// Handle typed action `A` with explicit options.
    pub fn on_with<A, R, F>(self, handler_name: &str, options: HandlerOptions, handler: F) -> Self
    where
        A: TypedAction,
        R: IntoHandled,
        F: Fn(&S, &StateContext, &A) -> R + Send + Sync + 'static,
    {
        self.on_types(
            &[A::TYPE],
            handler_name,
            options,
            move |state: &S, ctx: &StateContext, action: &ActionRef| -> anyhow::Result<Handled> {
                let typed = action.downcast_ref::<A>().ok_or_else(|| {
                    let name = std::any::type_name::<A>();
                    anyhow::anyhow!("action '{}' is not a {}", A::TYPE, name)
                })?;
                handler(state, ctx, typed).into_handled()
            },
        )
    }

    /// Bind one handler to any number of action type strings. The handler
    /// receives the action untyped.
    pub fn on_types<R, F>(
        mut self,
        action_types: &[&str],
        handler_name: &str,
        options: HandlerOptions,
        handler: F,
    ) -> Self
    where
        R: IntoHandled,
        F: Fn(&S, &StateContext, &ActionRef) -> R + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(
            move |instance: &(dyn Any + Send + Sync), ctx: &StateContext, action: &ActionRef| {
                handler(downcast_instance::<S>(instance)?, ctx, action).into_handled()
            },
        );
        for action_type in action_types {
            self.handlers
                .entry(action_type.to_string())
                .or_default()
                .push(ActionHandlerEntry {
                    handler_name: handler_name.to_string(),
                    action_type: action_type.to_string(),
                    options,
                    handler: erased.clone(),
                });
        }
        self
    }

    /// Lifecycle hook run once after the slice's defaults are in the tree
    /// and the dispatch pipeline is connected.
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&S, &StateContext) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(move |instance: &(dyn Any + Send + Sync), ctx: &StateContext| {
            hook(downcast_instance::<S>(instance)?, ctx);
            Ok(())
        }));
        self
    }

    /// Inherit the handler table and init hook of a state with the same
    /// handler-bearing type.
    pub fn extends(mut self, parent: &StateDescriptor) -> Self {
        if parent.state_type() != TypeId::of::<S>() {
            self.error.get_or_insert(StoreError::Configuration(format!(
                "state '{}' cannot extend '{}': handler types differ ({} vs {}), use extends_with",
                self.name,
                parent.name(),
                std::any::type_name::<S>(),
                parent.type_name()
            )));
            return self;
        }
        for (action_type, entries) in parent.handlers() {
            self.inherited
                .entry(action_type.clone())
                .or_default()
                .extend(entries.iter().cloned());
        }
        if let Some(init) = &parent.inner.init {
            self.inherited_init = Some(init.clone());
        }
        self
    }

    /// Inherit from a state whose handler-bearing type `P` is reachable
    /// from `S` through `projection`.
    pub fn extends_with<P, F>(mut self, parent: &StateDescriptor, projection: F) -> Self
    where
        P: Any + Send + Sync,
        F: Fn(&S) -> &P + Send + Sync + 'static,
    {
        if parent.state_type() != TypeId::of::<P>() {
            self.error.get_or_insert(StoreError::Configuration(format!(
                "state '{}' cannot extend '{}': its handler type is {}, not {}",
                self.name,
                parent.name(),
                parent.type_name(),
                std::any::type_name::<P>()
            )));
            return self;
        }
        let projection = Arc::new(projection);
        for (action_type, entries) in parent.handlers() {
            let slot = self.inherited.entry(action_type.clone()).or_default();
            for entry in entries {
                let inner = entry.handler.clone();
                let projection = projection.clone();
                let handler: ErasedHandler = Arc::new(
                    move |instance: &(dyn Any + Send + Sync),
                          ctx: &StateContext,
                          action: &ActionRef| {
                        let projected: &P = projection(downcast_instance::<S>(instance)?);
                        inner(projected, ctx, action)
                    },
                );
                slot.push(ActionHandlerEntry {
                    handler,
                    ..entry.clone()
                });
            }
        }
        if let Some(init) = parent.inner.init.clone() {
            let projection = projection.clone();
            let projected_init: ErasedInit =
                Arc::new(move |instance: &(dyn Any + Send + Sync), ctx: &StateContext| {
                    init(projection(downcast_instance::<S>(instance)?), ctx)
                });
            self.inherited_init = Some(projected_init);
        }
        self
    }

    /// Validate and produce the descriptor.
    pub fn build(self) -> Result<StateDescriptor, StoreError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        validate_name(&self.name)?;

        // Inherited entries first; the child's own table replaces any
        // action type it declares itself.
        let mut handlers = self.inherited;
        handlers.extend(self.handlers);

        Ok(StateDescriptor {
            inner: Arc::new(DescriptorInner {
                id: NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                defaults: self.defaults,
                children: self.children,
                handlers,
                init: self.init.or(self.inherited_init),
                factory: self.factory,
                state_type: TypeId::of::<S>(),
                type_name: std::any::type_name::<S>(),
                path: RwLock::new(None),
            }),
        })
    }
}

fn downcast_instance<S: Any>(instance: &(dyn Any + Send + Sync)) -> anyhow::Result<&S> {
    instance.downcast_ref::<S>().ok_or_else(|| {
        anyhow::anyhow!("handler-bearing object is not a {}", std::any::type_name::<S>())
    })
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::Configuration("states must be given a name".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StoreError::Configuration(format!(
            "state name '{name}' must only contain letters and digits"
        )));
    }
    Ok(())
}

// ── Registry ──

/// A Rust type that declares a state slice.
pub trait StateType: Any + Send + Sync + Sized {
    fn define() -> StateBuilder<Self>;
}

fn registry() -> &'static RwLock<HashMap<TypeId, StateDescriptor>> {
    static REGISTRY: OnceLock<RwLock<HashMap<TypeId, StateDescriptor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// The descriptor of `T`, building it on first use.
///
/// Idempotent: every call returns the same record. A failed `define()` is
/// not cached and is reported again on the next call.
pub fn ensure_metadata<T: StateType>() -> Result<StateDescriptor, StoreError> {
    if let Some(found) = get_metadata::<T>() {
        return Ok(found);
    }
    let built = T::define().build()?;
    let mut map = registry().write().unwrap();
    let descriptor = map.entry(TypeId::of::<T>()).or_insert(built).clone();
    debug!(
        state = descriptor.name(),
        type_name = descriptor.type_name(),
        "state metadata attached"
    );
    Ok(descriptor)
}

/// The descriptor of `T`, if it was already built.
pub fn get_metadata<T: StateType>() -> Option<StateDescriptor> {
    registry().read().unwrap().get(&TypeId::of::<T>()).cloned()
}

// ── Injector ──

/// Supplies handler-bearing objects for registered states.
pub trait Injector: Send + Sync {
    fn instantiate(&self, descriptor: &StateDescriptor) -> Result<Instance, StoreError>;
}

/// Closures implement `Injector`.
impl<F> Injector for F
where
    F: Fn(&StateDescriptor) -> Result<Instance, StoreError> + Send + Sync,
{
    fn instantiate(&self, descriptor: &StateDescriptor) -> Result<Instance, StoreError> {
        self(descriptor)
    }
}

/// Builds instances with the factory recorded on the descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactoryInjector;

impl Injector for FactoryInjector {
    fn instantiate(&self, descriptor: &StateDescriptor) -> Result<Instance, StoreError> {
        descriptor.create_instance().ok_or_else(|| {
            StoreError::Configuration(format!(
                "no instance provider for state '{}' ({})",
                descriptor.name(),
                descriptor.type_name()
            ))
        })
    }
}
