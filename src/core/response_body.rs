//! Outbound bodies. Every variant is written the same way: stream its
//! content into a [`ResponseChannel`] and report how many bytes went out.
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::{
    io::AsyncRead,
    sync::{mpsc, oneshot},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    ports::transport::{ResponseChannel, TransportError, TransportResult},
    reactive::{FlowError, Publisher, Subscriber, Subscription},
};

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// Streamed from an async reader.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// A file under `root`; the resolved path must stay inside it.
    File { root: PathBuf, path: String },
    /// Produced by a pipeline, one transport write per item.
    Stream(Arc<dyn Publisher<Bytes>>),
}

impl ResponseBody {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseBody::Bytes(Bytes::from(text.into()))
    }

    pub fn file(root: impl Into<PathBuf>, path: impl Into<String>) -> Self {
        ResponseBody::File {
            root: root.into(),
            path: path.into(),
        }
    }

    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        ResponseBody::Reader(Box::new(reader))
    }

    pub fn stream(publisher: Arc<dyn Publisher<Bytes>>) -> Self {
        ResponseBody::Stream(publisher)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Bytes(bytes) => bytes.is_empty(),
            _ => false,
        }
    }

    /// Length when known without doing any I/O.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Bytes(bytes) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    /// Write the whole body to `channel` and flush it.
    pub async fn write_to(self, channel: &mut dyn ResponseChannel) -> TransportResult<u64> {
        match self {
            ResponseBody::Empty => {
                channel.flush().await?;
                Ok(0)
            }
            ResponseBody::Bytes(bytes) => {
                let written = bytes.len() as u64;
                if !bytes.is_empty() {
                    channel.write(bytes).await?;
                }
                channel.flush().await?;
                Ok(written)
            }
            ResponseBody::Reader(reader) => copy_reader(reader, channel).await,
            ResponseBody::File { root, path } => {
                let resolved = resolve_within_root(&root, &path)?;
                let file = tokio::fs::File::open(&resolved).await?;
                copy_reader(file, channel).await
            }
            ResponseBody::Stream(publisher) => write_stream(publisher, channel).await,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponseBody::Reader(_) => f.write_str("Reader"),
            ResponseBody::File { root, path } => f
                .debug_struct("File")
                .field("root", root)
                .field("path", path)
                .finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::Empty
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Bytes(bytes)
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        ResponseBody::text(text)
    }
}

impl From<&'static str> for ResponseBody {
    fn from(text: &'static str) -> Self {
        ResponseBody::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// Resolve `path` against `root`, refusing anything that escapes it.
pub fn resolve_within_root(root: &Path, path: &str) -> TransportResult<PathBuf> {
    let full_path = root.join(path.trim_start_matches('/'));

    // Security check: ensure the resolved path is still within root
    let canonical_root = std::fs::canonicalize(root)?;
    let canonical_path = match std::fs::canonicalize(&full_path) {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return match full_path
                .parent()
                .and_then(|p| std::fs::canonicalize(p).ok())
            {
                Some(parent) if parent.starts_with(&canonical_root) => {
                    Err(TransportError::NotFound(path.to_string()))
                }
                _ => Err(TransportError::PathTraversal(path.to_string())),
            };
        }
        Err(e) => return Err(TransportError::Io(e)),
    };

    if !canonical_path.starts_with(&canonical_root) {
        warn!(path, root = %root.display(), "path traversal attempt blocked");
        return Err(TransportError::PathTraversal(path.to_string()));
    }
    if !canonical_path.is_file() {
        return Err(TransportError::NotFound(path.to_string()));
    }
    Ok(canonical_path)
}

async fn copy_reader(
    reader: impl AsyncRead + Send + Unpin,
    channel: &mut dyn ResponseChannel,
) -> TransportResult<u64> {
    let mut chunks = ReaderStream::with_capacity(reader, READ_CHUNK_SIZE);
    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        channel.write(chunk).await?;
    }
    channel.flush().await?;
    Ok(written)
}

/// Subscriber between a body pipeline and the transport: one item is
/// requested per acknowledged write.
struct WriteBridge {
    chunks: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    completion: Mutex<Option<oneshot::Sender<Result<(), FlowError>>>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl WriteBridge {
    fn request_next(&self) {
        let subscription = self.subscription.lock().clone();
        if let Some(subscription) = subscription {
            if let Err(error) = subscription.request(1) {
                debug!(%error, "body pipeline refused demand");
            }
        }
    }

    fn cancel(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    fn finish(&self, outcome: Result<(), FlowError>) {
        self.chunks.lock().take();
        if let Some(completion) = self.completion.lock().take() {
            let _ = completion.send(outcome);
        }
    }
}

impl Subscriber<Bytes> for WriteBridge {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.subscription.lock() = Some(subscription);
        self.request_next();
    }

    fn on_next(&self, item: Bytes) {
        if let Some(chunks) = self.chunks.lock().as_ref() {
            let _ = chunks.send(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.finish(Err(error));
    }

    fn on_complete(&self) {
        self.finish(Ok(()));
    }
}

async fn write_stream(
    publisher: Arc<dyn Publisher<Bytes>>,
    channel: &mut dyn ResponseChannel,
) -> TransportResult<u64> {
    let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = oneshot::channel();
    let bridge = Arc::new(WriteBridge {
        chunks: Mutex::new(Some(chunks_tx)),
        completion: Mutex::new(Some(completion_tx)),
        subscription: Mutex::new(None),
    });
    publisher.subscribe(bridge.clone());

    let completion = async {
        completion_rx
            .await
            .unwrap_or(Err(FlowError::Abandoned))
            .map_err(TransportError::Pipeline)
    };

    let writes = async {
        let mut written = 0u64;
        while let Some(chunk) = chunks_rx.recv().await {
            written += chunk.len() as u64;
            if let Err(error) = channel.write(chunk).await {
                bridge.cancel();
                return Err(error);
            }
            bridge.request_next();
        }
        channel.flush().await?;
        Ok(written)
    };

    let ((), written) = tokio::try_join!(completion, writes)?;
    Ok(written)
}
