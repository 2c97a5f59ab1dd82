use std::sync::Arc;

use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these (or on
// the variant), never on the human-readable message string.

/// Stable error code constants.
pub mod error_code {
    pub const CONFIGURATION: &str = "CONFIGURATION";
    pub const CIRCULAR_DEPENDENCY: &str = "CIRCULAR_DEPENDENCY";
    pub const UNSUPPORTED_OPERATION: &str = "UNSUPPORTED_OPERATION";
    pub const DISPATCH_FAILED: &str = "DISPATCH_FAILED";
    pub const MISSING_PATH: &str = "MISSING_PATH";
    pub const FROZEN_STATE: &str = "FROZEN_STATE";
    pub const SELECTOR_FAILED: &str = "SELECTOR_FAILED";
    pub const RESULT_DROPPED: &str = "RESULT_DROPPED";
}

// ── StoreError ──────────────────────────────────────────────────────

/// Unified error type for registration, dispatch and selection.
///
/// `Clone` because a dispatch outcome is replayed to every awaiter of the
/// same [`DispatchHandle`](crate::DispatchHandle).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Invalid state declaration: bad or duplicate name, a child that is
    /// not part of the registered set, a missing instance provider.
    #[error("{0}")]
    Configuration(String),

    /// A parent/child cycle among registered states.
    #[error(
        "circular dependency '{dependency}' is required by '{dependent}': {}",
        .chain.join(" -> ")
    )]
    CircularDependency {
        dependency: String,
        dependent: String,
        chain: Vec<String>,
    },

    /// `patch_state` with a list or a primitive.
    #[error("{0}")]
    UnsupportedOperation(String),

    /// An action handler or plugin failed while processing `action_type`.
    #[error("action '{action_type}' failed: {cause}")]
    Dispatch {
        action_type: String,
        cause: Arc<anyhow::Error>,
    },

    /// Read through a path segment that does not exist. Selectors turn
    /// this into a missing (`None`) result instead of an error.
    #[error("no value at '{0}'")]
    MissingPath(String),

    /// In-place mutation of a value that was published in development mode.
    #[error("cannot mutate frozen state value ({0})")]
    FrozenState(String),

    /// A selector projector failed for a reason other than a missing path.
    #[error("selector failed: {0}")]
    Selector(String),

    /// The result of a dispatch was never delivered.
    #[error("result of '{0}' was dropped before completion")]
    ResultDropped(String),
}

impl StoreError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::Configuration(_) => error_code::CONFIGURATION,
            StoreError::CircularDependency { .. } => error_code::CIRCULAR_DEPENDENCY,
            StoreError::UnsupportedOperation(_) => error_code::UNSUPPORTED_OPERATION,
            StoreError::Dispatch { .. } => error_code::DISPATCH_FAILED,
            StoreError::MissingPath(_) => error_code::MISSING_PATH,
            StoreError::FrozenState(_) => error_code::FROZEN_STATE,
            StoreError::Selector(_) => error_code::SELECTOR_FAILED,
            StoreError::ResultDropped(_) => error_code::RESULT_DROPPED,
        }
    }

    /// Wrap a handler or plugin failure for `action_type`.
    pub fn dispatch(action_type: impl Into<String>, cause: anyhow::Error) -> Self {
        StoreError::Dispatch {
            action_type: action_type.into(),
            cause: Arc::new(cause),
        }
    }

    /// The original failure carried by a `Dispatch` error, downcast to `E`.
    ///
    /// Handlers that fail with a `StoreError` (for example a rejected
    /// `patch_state`) can be recovered with `downcast_source::<StoreError>()`.
    pub fn downcast_source<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            StoreError::Dispatch { cause, .. } => cause.downcast_ref::<E>(),
            _ => None,
        }
    }
}
