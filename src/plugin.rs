use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

use crate::action::ActionRef;
use crate::error::StoreError;
use crate::value::StateValue;

/// Outcome of one dispatch: the state current at successful completion, or
/// `None` when the action was canceled.
pub type DispatchResult = Result<Option<StateValue>, StoreError>;

/// A boxed, `Send`-able future produced by each stage of the plugin chain.
pub type PluginOutput = BoxFuture<'static, DispatchResult>;

/// Continuation handed to a plugin: the rest of the chain.
pub type NextFn = Box<dyn FnOnce(StateValue, ActionRef) -> PluginOutput + Send>;

/// Final stage of the chain, run after every plugin called `next`.
pub type Terminal = Arc<dyn Fn(StateValue, ActionRef) -> PluginOutput + Send + Sync>;

/// Middleware between `dispatch` and the state-handling stage.
///
/// A plugin may rewrite the state or the action before calling `next`,
/// inspect or map the result afterwards, or short-circuit by not calling
/// `next` at all.
///
/// ```ignore
/// let logger = |state: StateValue, action: ActionRef, next: NextFn| -> PluginOutput {
///     tracing::info!(action = action.action_type(), "dispatching");
///     next(state, action)
/// };
/// ```
pub trait Plugin: Send + Sync {
    fn handle(&self, state: StateValue, action: ActionRef, next: NextFn) -> PluginOutput;
}

/// Convenience: closures implement Plugin.
impl<F> Plugin for F
where
    F: Fn(StateValue, ActionRef, NextFn) -> PluginOutput + Send + Sync,
{
    fn handle(&self, state: StateValue, action: ActionRef, next: NextFn) -> PluginOutput {
        self(state, action, next)
    }
}

/// Ordered plugin list of one composition root.
///
/// Child managers share their parent's list and append to it, so a feature
/// registration extends the root chain instead of replacing it.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Arc<RwLock<Vec<Arc<dyn Plugin>>>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins: Arc::new(RwLock::new(plugins)),
        }
    }

    /// A manager on the same chain, with `plugins` appended to it.
    pub fn child(&self, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        self.plugins.write().unwrap().extend(plugins);
        self.clone()
    }

    /// The chain as it is now.
    pub fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chain `plugins` in order in front of `terminal`.
pub fn compose(plugins: Vec<Arc<dyn Plugin>>, terminal: Terminal) -> NextFn {
    let chain: Arc<[Arc<dyn Plugin>]> = plugins.into();
    Box::new(move |state, action| next_at(chain, 0, terminal, state, action))
}

fn next_at(
    chain: Arc<[Arc<dyn Plugin>]>,
    index: usize,
    terminal: Terminal,
    state: StateValue,
    action: ActionRef,
) -> PluginOutput {
    match chain.get(index).cloned() {
        None => terminal(state, action),
        Some(plugin) => {
            let next: NextFn =
                Box::new(move |state, action| next_at(chain, index + 1, terminal, state, action));
            plugin.handle(state, action, next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::DynAction;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    fn echo_terminal(calls: Arc<Mutex<Vec<String>>>) -> Terminal {
        Arc::new(move |state: StateValue, action: ActionRef| -> PluginOutput {
            calls.lock().unwrap().push(format!("terminal:{}", action.action_type()));
            futures::future::ready(Ok(Some(state))).boxed()
        })
    }

    fn tagging_plugin(tag: &'static str, calls: Arc<Mutex<Vec<String>>>) -> Arc<dyn Plugin> {
        Arc::new(move |state: StateValue, action: ActionRef, next: NextFn| -> PluginOutput {
            calls.lock().unwrap().push(tag.to_string());
            next(state, action)
        })
    }

    fn ping() -> ActionRef {
        Arc::new(DynAction::new("ping"))
    }

    // ========================================================================
    // Composition
    // ========================================================================

    #[tokio::test]
    async fn plugins_run_in_order_before_terminal() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = compose(
            vec![tagging_plugin("a", calls.clone()), tagging_plugin("b", calls.clone())],
            echo_terminal(calls.clone()),
        );

        let result = chain(StateValue::map(), ping()).await.unwrap();
        assert!(result.is_some());
        assert_eq!(*calls.lock().unwrap(), ["a", "b", "terminal:ping"]);
    }

    #[tokio::test]
    async fn plugin_can_rewrite_state_and_action() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let rewrite: Arc<dyn Plugin> =
            Arc::new(|state: StateValue, _action: ActionRef, next: NextFn| -> PluginOutput {
                next(state.with("touched", true), Arc::new(DynAction::new("pong")))
            });
        let chain = compose(vec![rewrite], echo_terminal(calls.clone()));

        let result = chain(StateValue::map(), ping()).await.unwrap().unwrap();
        assert_eq!(result.to_json(), json!({"touched": true}));
        assert_eq!(*calls.lock().unwrap(), ["terminal:pong"]);
    }

    #[tokio::test]
    async fn plugin_can_short_circuit() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let block: Arc<dyn Plugin> =
            Arc::new(|_state: StateValue, _action: ActionRef, _next: NextFn| -> PluginOutput {
                futures::future::ready(Ok(None)).boxed()
            });
        let chain = compose(vec![block], echo_terminal(calls.clone()));

        assert!(chain(StateValue::map(), ping()).await.unwrap().is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plugin_error_becomes_dispatch_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let failing: Arc<dyn Plugin> =
            Arc::new(|_state: StateValue, action: ActionRef, _next: NextFn| -> PluginOutput {
                let err = StoreError::dispatch(action.action_type(), anyhow::anyhow!("denied"));
                futures::future::ready(Err(err)).boxed()
            });
        let chain = compose(vec![failing], echo_terminal(calls));

        let err = chain(StateValue::map(), ping()).await.unwrap_err();
        assert_eq!(err.to_string(), "action 'ping' failed: denied");
    }

    // ========================================================================
    // PluginManager
    // ========================================================================

    #[test]
    fn child_manager_appends_to_root_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let root = PluginManager::new(vec![tagging_plugin("root", calls.clone())]);
        let feature = root.child(vec![tagging_plugin("feature", calls.clone())]);

        assert_eq!(root.len(), 2);
        assert_eq!(feature.len(), 2);
        assert!(PluginManager::default().is_empty());
    }

    #[tokio::test]
    async fn child_plugins_run_after_root_plugins() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let root = PluginManager::new(vec![tagging_plugin("root", calls.clone())]);
        root.child(vec![tagging_plugin("feature", calls.clone())]);

        let chain = compose(root.snapshot(), echo_terminal(calls.clone()));
        chain(StateValue::map(), ping()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), ["root", "feature", "terminal:ping"]);
    }
}
