use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;
use crate::value::StateValue;

/// Helper supertrait giving every action an `&dyn Any` view for downcasting.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A dispatchable record with a type discriminator.
///
/// Handlers are selected by `action_type()` only. Implement
/// [`TypedAction`] for the common "type constant on the struct" form, or
/// use [`DynAction`] when the type is only known at runtime.
pub trait Action: AsAny + Send + Sync + fmt::Debug {
    fn action_type(&self) -> &str;
}

/// An action whose type string is a constant of the Rust type.
///
/// ```ignore
/// #[derive(Debug)]
/// struct AddItem(String);
/// impl TypedAction for AddItem {
///     const TYPE: &'static str = "[Cart] Add item";
/// }
/// ```
pub trait TypedAction: Any + Send + Sync + fmt::Debug {
    const TYPE: &'static str;
}

impl<T: TypedAction> Action for T {
    fn action_type(&self) -> &str {
        T::TYPE
    }
}

/// A dispatched action instance. Identity (`Arc::ptr_eq`) distinguishes two
/// dispatches of equal actions.
pub type ActionRef = Arc<dyn Action>;

impl dyn Action {
    /// Downcast to the concrete action type.
    pub fn downcast_ref<A: Action + 'static>(&self) -> Option<&A> {
        self.as_any().downcast_ref::<A>()
    }
}

/// Conversion into a shareable [`ActionRef`].
///
/// Lets `dispatch` accept either a plain action value or an existing
/// `ActionRef` whose identity the caller wants to keep.
pub trait IntoAction {
    fn into_action(self) -> ActionRef;
}

impl<A: Action + 'static> IntoAction for A {
    fn into_action(self) -> ActionRef {
        Arc::new(self)
    }
}

impl IntoAction for ActionRef {
    fn into_action(self) -> ActionRef {
        self
    }
}

/// An action with a runtime type string and a free-form payload.
#[derive(Debug, Clone)]
pub struct DynAction {
    pub action_type: String,
    pub payload: StateValue,
}

impl DynAction {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: StateValue::Null,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<StateValue>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl Action for DynAction {
    fn action_type(&self) -> &str {
        &self.action_type
    }
}

// ── Built-in lifecycle actions ──

/// Dispatched once when the root store has merged its initial defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitState;

impl TypedAction for InitState {
    const TYPE: &'static str = "@@INIT";
}

/// Dispatched each time a feature registration merges new defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateState;

impl TypedAction for UpdateState {
    const TYPE: &'static str = "@@UPDATE_STATE";
}

// ── Envelopes ──

/// Lifecycle status of one dispatched action instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionStatus {
    Dispatched,
    Successful,
    Canceled,
    Errored,
}

impl ActionStatus {
    /// `Successful`, `Canceled` and `Errored` end an action's lifecycle.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Dispatched)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Dispatched => "DISPATCHED",
            ActionStatus::Successful => "SUCCESSFUL",
            ActionStatus::Canceled => "CANCELED",
            ActionStatus::Errored => "ERRORED",
        };
        f.write_str(s)
    }
}

/// The `{action, status, error}` envelope carried by the action streams.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub action: ActionRef,
    pub status: ActionStatus,
    pub error: Option<StoreError>,
}

impl ActionContext {
    pub fn dispatched(action: ActionRef) -> Self {
        Self::with_status(action, ActionStatus::Dispatched)
    }

    pub fn successful(action: ActionRef) -> Self {
        Self::with_status(action, ActionStatus::Successful)
    }

    pub fn canceled(action: ActionRef) -> Self {
        Self::with_status(action, ActionStatus::Canceled)
    }

    pub fn errored(action: ActionRef, error: StoreError) -> Self {
        Self {
            action,
            status: ActionStatus::Errored,
            error: Some(error),
        }
    }

    fn with_status(action: ActionRef, status: ActionStatus) -> Self {
        Self {
            action,
            status,
            error: None,
        }
    }

    /// Whether this envelope belongs to exactly `action` (same instance).
    pub fn is_for(&self, action: &ActionRef) -> bool {
        Arc::ptr_eq(&self.action, action)
    }
}

// ── Filtering ──

/// Predicate over action envelopes by type and status.
///
/// ```ignore
/// let done = ActionFilter::of::<AddItem>().successful();
/// store.actions().subscribe(move |ctx| if done.matches(ctx) { /* ... */ });
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    types: Vec<String>,
    status: Option<ActionStatus>,
}

impl ActionFilter {
    /// Match any of the given action types, in any status.
    pub fn of_action<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            status: None,
        }
    }

    /// Match one typed action, in any status.
    pub fn of<A: TypedAction>() -> Self {
        Self::of_action([A::TYPE])
    }

    /// Also match another typed action.
    pub fn or<A: TypedAction>(mut self) -> Self {
        self.types.push(A::TYPE.to_string());
        self
    }

    pub fn dispatched(self) -> Self {
        self.status(ActionStatus::Dispatched)
    }

    pub fn successful(self) -> Self {
        self.status(ActionStatus::Successful)
    }

    pub fn canceled(self) -> Self {
        self.status(ActionStatus::Canceled)
    }

    pub fn errored(self) -> Self {
        self.status(ActionStatus::Errored)
    }

    fn status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, ctx: &ActionContext) -> bool {
        if let Some(status) = self.status {
            if ctx.status != status {
                return false;
            }
        }
        self.types.iter().any(|t| t == ctx.action.action_type())
    }
}

/// A predicate that accepts any action with the same type as `action`.
pub fn action_matcher(action: &dyn Action) -> impl Fn(&dyn Action) -> bool + Send + Sync + 'static {
    let action_type = action.action_type().to_string();
    move |other| other.action_type() == action_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct AddItem(&'static str);

    impl TypedAction for AddItem {
        const TYPE: &'static str = "[Cart] Add item";
    }

    #[derive(Debug)]
    struct Clear;

    impl TypedAction for Clear {
        const TYPE: &'static str = "[Cart] Clear";
    }

    // ========================================================================
    // Type discrimination
    // ========================================================================

    #[test]
    fn typed_action_exposes_constant_type() {
        let action: ActionRef = AddItem("x").into_action();
        assert_eq!(action.action_type(), "[Cart] Add item");
    }

    #[test]
    fn dyn_action_exposes_own_type() {
        let action = DynAction::new("ping").with_payload(3);
        assert_eq!(action.action_type(), "ping");
        assert_eq!(action.payload.as_i64(), Some(3));
    }

    #[test]
    fn downcast_to_concrete_action() {
        let action: ActionRef = AddItem("x").into_action();
        assert_eq!(action.downcast_ref::<AddItem>().map(|a| a.0), Some("x"));
        assert!(action.downcast_ref::<Clear>().is_none());
    }

    #[test]
    fn into_action_keeps_existing_identity() {
        let action: ActionRef = Arc::new(Clear);
        let again = action.clone().into_action();
        assert!(Arc::ptr_eq(&action, &again));
    }

    #[test]
    fn builtin_action_types() {
        assert_eq!(InitState.action_type(), "@@INIT");
        assert_eq!(UpdateState.action_type(), "@@UPDATE_STATE");
    }

    // ========================================================================
    // Envelopes and filters
    // ========================================================================

    #[test]
    fn envelope_identity() {
        let a: ActionRef = Arc::new(Clear);
        let b: ActionRef = Arc::new(Clear);
        let ctx = ActionContext::successful(a.clone());
        assert!(ctx.is_for(&a));
        assert!(!ctx.is_for(&b));
        assert!(ctx.status.is_terminal());
        assert!(!ActionContext::dispatched(a).status.is_terminal());
    }

    #[test]
    fn filter_by_type_and_status() {
        let add: ActionRef = Arc::new(AddItem("x"));
        let clear: ActionRef = Arc::new(Clear);

        let any_add = ActionFilter::of::<AddItem>();
        assert!(any_add.matches(&ActionContext::dispatched(add.clone())));
        assert!(!any_add.matches(&ActionContext::dispatched(clear.clone())));

        let add_done = ActionFilter::of::<AddItem>().successful();
        assert!(add_done.matches(&ActionContext::successful(add.clone())));
        assert!(!add_done.matches(&ActionContext::dispatched(add.clone())));

        let either = ActionFilter::of::<AddItem>().or::<Clear>().errored();
        let err = StoreError::dispatch("[Cart] Clear", anyhow::anyhow!("boom"));
        assert!(either.matches(&ActionContext::errored(clear, err)));
        assert!(!either.matches(&ActionContext::canceled(add)));
    }

    #[test]
    fn filter_by_runtime_type_strings() {
        let filter = ActionFilter::of_action(["ping", "pong"]).dispatched();
        let ping: ActionRef = Arc::new(DynAction::new("ping"));
        assert!(filter.matches(&ActionContext::dispatched(ping)));
    }

    #[test]
    fn matcher_compares_types_only() {
        let first = AddItem("x");
        let matches = action_matcher(&first);
        assert!(matches(&AddItem("y")));
        assert!(!matches(&Clear));
        assert!(matches(&DynAction::new("[Cart] Add item")));
    }

    #[test]
    fn status_display() {
        assert_eq!(ActionStatus::Canceled.to_string(), "CANCELED");
    }
}
