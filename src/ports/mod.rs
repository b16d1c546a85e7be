pub mod body_codec;
pub mod config_source;
pub mod executor;
pub mod transport;

/// Re-export the port traits
pub use body_codec::BodyCodec;
pub use config_source::{ConfigError, ConfigSource, ConfigSourceExt};
pub use executor::{Executor, ExecutorError, ExecutorResult, ExecutorSupply, Task};
pub use transport::{BufferedChannel, ResponseChannel, TransportError, TransportResult};
