use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::reactive::FlowError;

/// Error type for writing responses out through a transport
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// Error when encountering an IO issue
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer went away before the body was fully written
    #[error("Transport channel closed")]
    Closed,

    /// A file body resolved outside its permitted root
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    /// A file body does not exist
    #[error("File not found: {0}")]
    NotFound(String),

    /// The pipeline producing the body failed
    #[error("Response pipeline failed: {0}")]
    Pipeline(#[source] FlowError),
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// ResponseChannel defines the port (interface) a response body is written to
///
/// A `write` resolves once the transport has accepted the chunk; `flush`
/// resolves once everything written so far has been handed to the peer.
#[async_trait]
pub trait ResponseChannel: Send {
    /// Write one chunk of body content
    async fn write(&mut self, chunk: Bytes) -> TransportResult<()>;

    /// Flush buffered content
    async fn flush(&mut self) -> TransportResult<()>;
}

/// Collects everything written; useful for tests and in-process callers.
#[derive(Debug, Default)]
pub struct BufferedChannel {
    pub chunks: Vec<Bytes>,
    pub flushes: usize,
}

impl BufferedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written, concatenated.
    pub fn concat(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

#[async_trait]
impl ResponseChannel for BufferedChannel {
    async fn write(&mut self, chunk: Bytes) -> TransportResult<()> {
        self.chunks.push(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> TransportResult<()> {
        self.flushes += 1;
        Ok(())
    }
}
