use thiserror::Error;

use crate::reactive::FlowError;

/// Unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Error type for executor lookup and task submission
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutorError {
    /// No executor is registered under this qualifier
    #[error("Unknown executor: {0}")]
    Unknown(String),

    /// An executor with this qualifier is already registered
    #[error("Executor already registered: {0}")]
    Duplicate(String),

    /// The executor refused the task (shut down, saturated, ...)
    #[error("Executor '{executor}' rejected task: {reason}")]
    Rejected { executor: String, reason: String },

    /// Worker threads could not be started
    #[error("Failed to build executor '{executor}': {source}")]
    Build {
        executor: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

impl From<ExecutorError> for FlowError {
    fn from(error: ExecutorError) -> Self {
        match error {
            ExecutorError::Rejected { executor, reason } => FlowError::Rejected { executor, reason },
            other => FlowError::new(other),
        }
    }
}

/// Executor defines the port (interface) for running work off the calling thread
///
/// Implementations decide where a task runs; callers only rely on it running
/// at most once.
pub trait Executor: Send + Sync + 'static {
    /// Qualifier this executor is known by
    fn name(&self) -> &str;

    /// Submit a task for execution
    fn execute(&self, task: Task) -> ExecutorResult<()>;
}

/// Executor supply keyed by qualifier ("default", "manage", "scheduled", ...)
pub trait ExecutorSupply: Send + Sync + 'static {
    /// Resolve an executor by qualifier
    fn executor(&self, qualifier: &str) -> ExecutorResult<std::sync::Arc<dyn Executor>>;
}
