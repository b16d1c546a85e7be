pub mod codecs;
pub mod executors;
pub mod property_source;
pub mod scheduler;
pub mod transport;

/// Re-export commonly used types from adapters
pub use codecs::{JsonCodec, TextCodec, standard_codecs};
pub use executors::{
    DEFAULT_EXECUTOR, ExecutorRegistry, InlineExecutor, MANAGE_EXECUTOR, SCHEDULED_EXECUTOR,
    WorkerPool,
};
pub use property_source::PropertySource;
pub use scheduler::{ScheduleHandle, Scheduler};
pub use transport::HttpBridge;
