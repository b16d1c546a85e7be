use std::{
    any::Any,
    error::Error as StdError,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use thiserror::Error;

use super::SubscriptionState;

/// Type-erased error that can be cloned across stages.
///
/// The wrapped error is exposed through [`StdError::source`] so that a cause
/// walk starting at a [`FlowError`] reaches the original typed error.
#[derive(Clone)]
pub struct SharedError(Arc<dyn StdError + Send + Sync + 'static>);

impl SharedError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Borrow the wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for SharedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Errors travelling through a processing chain as `on_error` signals, or
/// returned synchronously by subscription operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// `request(n)` was called with `n == 0`.
    #[error("requested demand must be positive, got {0}")]
    InvalidDemand(u64),

    /// A strict subscription was asked for demand outside the SUBSCRIBED state.
    #[error("subscription is {state}, expected SUBSCRIBED")]
    NotSubscribed { state: SubscriptionState },

    /// A publisher that accepts a single subscriber was subscribed twice.
    #[error("publisher already has a subscriber")]
    AlreadySubscribed,

    /// A bounded stage buffer could not accept another item.
    #[error("buffer overflow: {capacity} items already queued")]
    BufferOverflow { capacity: usize },

    /// User code rejected its input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// User code panicked inside a stage.
    #[error("stage panicked: {0}")]
    Panicked(String),

    /// The chain was torn down before its terminal subscriber resolved.
    #[error("pipeline was dropped before it completed")]
    Abandoned,

    /// A worker pool refused a task.
    #[error("executor '{executor}' rejected a task: {reason}")]
    Rejected { executor: String, reason: String },

    /// An error-recovery stage failed while handling `original`.
    #[error("recovery failed: {recovery} (while handling: {original})")]
    RecoveryFailed {
        original: Box<FlowError>,
        #[source]
        recovery: Box<FlowError>,
    },

    /// Any other error raised by user code.
    #[error(transparent)]
    Failed(SharedError),
}

impl FlowError {
    /// Wrap an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FlowError::Failed(SharedError::new(error))
    }

    /// Walk this error and its causes, returning the first one of type `E`.
    pub fn find_cause<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(error) = current {
            if let Some(found) = error.downcast_ref::<E>() {
                return Some(found);
            }
            current = error.source();
        }
        None
    }

    /// Whether any error in the cause chain is an argument-style failure.
    pub fn is_bad_argument(&self) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(error) = current {
            if let Some(flow) = error.downcast_ref::<FlowError>() {
                if matches!(
                    flow,
                    FlowError::InvalidArgument(_) | FlowError::InvalidDemand(_)
                ) {
                    return true;
                }
            }
            if error.downcast_ref::<serde_json::Error>().is_some() {
                return true;
            }
            current = error.source();
        }
        false
    }
}

/// Run stage code, turning a panic into [`FlowError::Panicked`].
pub(crate) fn guard<R>(f: impl FnOnce() -> Result<R, FlowError>) -> Result<R, FlowError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(FlowError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
