//! Dispatch pipeline: plugin chain, terminal stage and result delivery.
//!
//! Every dispatched action instance moves `Dispatched → Successful |
//! Canceled | Errored`. The terminal stage publishes the plugin chain's
//! state, listens on the internal result stream for this exact instance,
//! then announces `Dispatched` on the public stream. The caller gets a
//! [`DispatchHandle`]: a cloneable future that replays the outcome to any
//! number of awaiters while the underlying work runs once.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tracing::trace;

use crate::action::{ActionContext, ActionRef, ActionStatus};
use crate::actions_stream::ActionStream;
use crate::config::{ErrorHook, Spawner, StoreConfig};
use crate::error::StoreError;
use crate::plugin::{DispatchResult, PluginManager, PluginOutput, Terminal, compose};
use crate::stream::StateStream;
use crate::value::StateValue;

/// Replaying handle on the outcome of one `dispatch` call.
///
/// Resolves to `Ok(Some(state))` on success, `Ok(None)` when the action was
/// canceled, `Err` when a plugin or handler failed. Dropping every handle
/// does not stop the dispatch.
#[derive(Clone)]
pub struct DispatchHandle {
    inner: Shared<BoxFuture<'static, DispatchResult>>,
}

impl DispatchHandle {
    pub(crate) fn new(fut: BoxFuture<'static, DispatchResult>) -> Self {
        Self { inner: fut.shared() }
    }

    /// A handle that is already resolved.
    ///
    /// The shared future is polled once here so `peek` sees the outcome
    /// without anyone awaiting the handle.
    pub fn ready(result: DispatchResult) -> Self {
        let handle = Self::new(future::ready(result).boxed());
        let _ = handle.inner.clone().now_or_never();
        handle
    }

    /// The outcome, if the dispatch already finished.
    pub fn peek(&self) -> Option<DispatchResult> {
        self.inner.peek().cloned()
    }
}

impl Future for DispatchHandle {
    type Output = DispatchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// Runs dispatches against one composition root.
pub struct Dispatcher {
    state: Arc<StateStream>,
    actions: Arc<ActionStream>,
    results: Arc<ActionStream>,
    plugins: PluginManager,
    error_hook: ErrorHook,
    spawner: Spawner,
    development_mode: bool,
}

impl Dispatcher {
    pub fn new(
        state: Arc<StateStream>,
        actions: Arc<ActionStream>,
        results: Arc<ActionStream>,
        plugins: PluginManager,
        config: &StoreConfig,
    ) -> Self {
        Self {
            state,
            actions,
            results,
            plugins,
            error_hook: config.error_hook.clone(),
            spawner: config.spawner.clone(),
            development_mode: config.development_mode,
        }
    }

    pub fn state(&self) -> &Arc<StateStream> {
        &self.state
    }

    /// The public `{action, status}` stream.
    pub fn actions(&self) -> &Arc<ActionStream> {
        &self.actions
    }

    /// The internal stream carrying terminal statuses only.
    pub fn results(&self) -> &Arc<ActionStream> {
        &self.results
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub(crate) fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    /// Dispatch one action.
    pub fn dispatch(&self, action: ActionRef) -> DispatchHandle {
        self.drive(self.dispatch_single(action))
    }

    /// Dispatch several actions concurrently as one call.
    ///
    /// Fails with the first member error; resolves to the state current
    /// when the last member finished, or `None` if any member was canceled.
    pub fn dispatch_all(&self, mut actions: Vec<ActionRef>) -> DispatchHandle {
        if actions.len() == 1 {
            if let Some(action) = actions.pop() {
                return self.dispatch(action);
            }
        }
        let members: Vec<PluginOutput> = actions
            .into_iter()
            .map(|action| self.dispatch_single(action))
            .collect();
        let state = self.state.clone();
        let batch = async move {
            let outcomes = future::try_join_all(members).await?;
            if outcomes.iter().any(Option::is_none) {
                return Ok(None);
            }
            Ok(Some(state.current()))
        };
        self.drive(batch.boxed())
    }

    /// Start the work and report a failure to the error hook exactly once.
    fn drive(&self, fut: BoxFuture<'static, DispatchResult>) -> DispatchHandle {
        let handle = DispatchHandle::new(fut);
        let hook = self.error_hook.clone();
        let watcher = handle.inner.clone();

        match watcher.clone().now_or_never() {
            Some(Ok(_)) => {}
            Some(Err(err)) => hook(&err),
            None => (self.spawner)(
                async move {
                    if let Err(err) = watcher.await {
                        hook(&err);
                    }
                }
                .boxed(),
            ),
        }
        handle
    }

    fn dispatch_single(&self, action: ActionRef) -> PluginOutput {
        trace!(action = action.action_type(), "dispatching");
        let prev = self.state.current();
        let chain = compose(self.plugins.snapshot(), self.terminal(prev.clone()));
        chain(prev, action)
    }

    fn terminal(&self, prev: StateValue) -> Terminal {
        let state = self.state.clone();
        let actions = self.actions.clone();
        let results = Arc::downgrade(&self.results);
        let freeze = self.development_mode;

        Arc::new(move |next_state: StateValue, action: ActionRef| -> PluginOutput {
            if !next_state.ptr_eq(&prev) {
                if freeze {
                    next_state.deep_freeze();
                }
                state.publish(next_state);
            }
            let Some(result_stream) = results.upgrade() else {
                let err = StoreError::ResultDropped(action.action_type().to_string());
                return future::ready(Err(err)).boxed();
            };

            let rx = await_result(&result_stream, &results, &state, &actions, &action);
            actions.publish(ActionContext::dispatched(action.clone()));

            let action_type = action.action_type().to_string();
            async move { rx.await.unwrap_or(Err(StoreError::ResultDropped(action_type))) }.boxed()
        })
    }
}

/// Subscribe to the terminal envelope of exactly `action`.
///
/// On arrival the envelope is forwarded to the public stream, then the
/// outcome is computed and sent once; the subscription removes itself.
fn await_result(
    result_stream: &Arc<ActionStream>,
    results: &Weak<ActionStream>,
    state: &Arc<StateStream>,
    actions: &Arc<ActionStream>,
    action: &ActionRef,
) -> oneshot::Receiver<DispatchResult> {
    let (tx, rx) = oneshot::channel::<DispatchResult>();
    let tx = Mutex::new(Some(tx));
    let own_id = Arc::new(OnceLock::new());
    let finished = Arc::new(AtomicBool::new(false));

    let id = {
        let results = results.clone();
        let state = state.clone();
        let actions = actions.clone();
        let action = action.clone();
        let own_id = own_id.clone();
        let finished = finished.clone();
        result_stream.subscribe(move |ctx: &ActionContext| {
            if !ctx.is_for(&action) || !ctx.status.is_terminal() {
                return;
            }
            let Some(tx) = tx.lock().unwrap().take() else {
                return;
            };
            actions.publish(ctx.clone());
            let outcome = match ctx.status {
                ActionStatus::Successful => Ok(Some(state.current())),
                ActionStatus::Canceled | ActionStatus::Dispatched => Ok(None),
                ActionStatus::Errored => Err(ctx.error.clone().unwrap_or_else(|| {
                    StoreError::dispatch(
                        action.action_type(),
                        anyhow::anyhow!("action errored without an error value"),
                    )
                })),
            };
            let _ = tx.send(outcome);

            match (own_id.get(), results.upgrade()) {
                (Some(id), Some(stream)) => {
                    stream.unsubscribe(*id);
                }
                _ => finished.store(true, Ordering::Release),
            }
        })
    };
    let _ = own_id.set(id);
    if finished.load(Ordering::Acquire) {
        result_stream.unsubscribe(id);
    }
    rx
}
