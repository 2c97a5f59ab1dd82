use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::StoreError;
use crate::metadata::{FactoryInjector, Injector};
use crate::plugin::Plugin;

/// Global sink for failed dispatch calls.
pub type ErrorHook = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Executor seam for completion work that cannot finish synchronously.
pub type Spawner = Arc<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>;

/// Configuration of one store (composition root).
///
/// Built with `Default` plus the `with_*` methods, or parsed from
/// command-line style flags by [`StoreConfig::from_args`].
#[derive(Clone)]
pub struct StoreConfig {
    /// Deep-freeze every published state tree.
    pub development_mode: bool,

    /// Root plugin chain, run in order before the state-handling stage.
    pub plugins: Vec<Arc<dyn Plugin>>,

    /// Receives the error of every failing `dispatch` call, once per call.
    /// Defaults to logging with `tracing::error!`.
    pub error_hook: ErrorHook,

    /// Runs pending completion work. Defaults to the current tokio runtime,
    /// or a helper thread when there is none.
    pub spawner: Spawner,

    /// Supplies handler-bearing objects. Defaults to the factory recorded
    /// on each state descriptor.
    pub injector: Arc<dyn Injector>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            development_mode: false,
            plugins: Vec::new(),
            error_hook: Arc::new(log_error),
            spawner: Arc::new(spawn_default),
            injector: Arc::new(FactoryInjector),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("development_mode", &self.development_mode)
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Supported flags:
    /// - `--development-mode`
    /// - `--development-mode=true|false`
    pub fn from_args(args: &[String]) -> Self {
        let mut config = StoreConfig::default();

        for arg in args {
            if arg == "--development-mode" {
                config.development_mode = true;
            } else if let Some(val) = arg.strip_prefix("--development-mode=") {
                match val {
                    "true" | "1" => config.development_mode = true,
                    "false" | "0" => config.development_mode = false,
                    other => {
                        debug!(value = other, "ignoring unrecognized --development-mode value")
                    }
                }
            }
        }

        config
    }

    /// Apply the serializable part of the configuration.
    pub fn with_options(mut self, options: &StoreOptions) -> Self {
        self.development_mode = options.development_mode;
        self
    }

    pub fn with_development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    pub fn with_plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn with_plugins(mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StoreError) + Send + Sync + 'static,
    {
        self.error_hook = Arc::new(hook);
        self
    }

    pub fn with_spawner<F>(mut self, spawner: F) -> Self
    where
        F: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
    {
        self.spawner = Arc::new(spawner);
        self
    }

    pub fn with_injector<I: Injector + 'static>(mut self, injector: I) -> Self {
        self.injector = Arc::new(injector);
        self
    }
}

/// Data-only store options, loadable from JSON or any serde format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub development_mode: bool,
}

impl StoreOptions {
    pub fn from_json(text: &str) -> Result<Self, StoreError> {
        serde_json::from_str(text)
            .map_err(|e| StoreError::Configuration(format!("invalid store options: {e}")))
    }
}

fn log_error(err: &StoreError) {
    error!(code = err.error_code(), "unhandled dispatch error: {err}");
}

fn spawn_default(task: BoxFuture<'static, ()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => {
            debug!("no tokio runtime, driving task on a helper thread");
            std::thread::spawn(move || futures::executor::block_on(task));
        }
    }
}
