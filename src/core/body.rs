//! Inbound request bodies.
//!
//! The transport appends chunks as they arrive. Every append, the size check
//! and any attached reader run under one lock. Crossing the size limit fails
//! the body for good: the buffer is discarded, the reader and waiters see
//! `413`, and every later chunk is refused.
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use super::error::HttpError;
use crate::reactive::error::panic_message;

/// Chunks kept as received, readable as one contiguous [`Buf`].
#[derive(Debug, Default, Clone)]
pub struct CompositeBuffer {
    chunks: VecDeque<Bytes>,
    remaining: usize,
}

impl CompositeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.remaining += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.remaining = 0;
    }

    /// Unread bytes from `offset` on, chunk by chunk, without copying.
    pub fn slices_from(&self, mut offset: usize) -> impl Iterator<Item = &[u8]> + '_ {
        self.chunks.iter().filter_map(move |chunk| {
            if offset >= chunk.len() {
                offset -= chunk.len();
                return None;
            }
            let slice = &chunk[offset..];
            offset = 0;
            Some(slice)
        })
    }

    /// Unread bytes as one buffer, without consuming them.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.remaining);
                for chunk in &self.chunks {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        }
    }
}

impl Buf for CompositeBuffer {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.chunks.front().map(|c| c.as_ref()).unwrap_or_default()
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "advance past end of composite buffer");
        self.remaining -= cnt;
        while cnt > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if cnt < front.len() {
                front.advance(cnt);
                break;
            }
            cnt -= front.len();
            self.chunks.pop_front();
        }
    }
}

/// Incremental consumer attached with [`StreamingBody::read_async`].
trait BodyReader: Send {
    /// Returns `true` once the reader is finished and can be detached. An
    /// error means the reader itself broke and the body must be failed.
    fn on_data(&mut self, buffer: &mut CompositeBuffer, last: bool) -> Result<bool, HttpError>;
    fn on_error(self: Box<Self>, error: HttpError);
}

struct PendingReader<T, F> {
    read: F,
    resolve: Option<oneshot::Sender<Result<T, HttpError>>>,
}

impl<T, F> BodyReader for PendingReader<T, F>
where
    T: Send,
    F: FnMut(&mut CompositeBuffer, bool) -> Result<Option<T>, HttpError> + Send,
{
    fn on_data(&mut self, buffer: &mut CompositeBuffer, last: bool) -> Result<bool, HttpError> {
        let read = &mut self.read;
        let result = match catch_unwind(AssertUnwindSafe(|| read(buffer, last))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "request body reader panicked");
                return Err(HttpError::internal(format!(
                    "Request body reader panicked: {message}"
                )));
            }
        };
        let outcome = match result {
            Ok(Some(value)) => Ok(value),
            Ok(None) if !last => return Ok(false),
            Ok(None) => Err(HttpError::bad_request(
                "Request body ended before it could be read",
            )),
            Err(error) => Err(error),
        };
        if let Some(resolve) = self.resolve.take() {
            let _ = resolve.send(outcome);
        }
        Ok(true)
    }

    fn on_error(mut self: Box<Self>, error: HttpError) {
        if let Some(resolve) = self.resolve.take() {
            let _ = resolve.send(Err(error));
        }
    }
}

/// Value being produced by an attached body reader.
pub struct PendingRead<T> {
    rx: oneshot::Receiver<Result<T, HttpError>>,
}

impl<T> Future for PendingRead<T> {
    type Output = Result<T, HttpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(HttpError::internal("Body reader was dropped")))
        })
    }
}

type Outcome = Option<Result<Bytes, HttpError>>;

struct BodyState {
    buffer: CompositeBuffer,
    received: u64,
    finished: bool,
    failed: Option<HttpError>,
    trailers: Option<HeaderMap>,
    reader: Option<Box<dyn BodyReader>>,
    reader_attached: bool,
}

pub struct StreamingBody {
    max_content_length: u64,
    state: Mutex<BodyState>,
    outcome: watch::Sender<Outcome>,
}

impl StreamingBody {
    pub fn new(max_content_length: u64) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            max_content_length,
            state: Mutex::new(BodyState {
                buffer: CompositeBuffer::new(),
                received: 0,
                finished: false,
                failed: None,
                trailers: None,
                reader: None,
                reader_attached: false,
            }),
            outcome,
        }
    }

    /// Body that is already complete.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let body = Self::new(data.len() as u64);
        // cannot fail: the limit is the payload size
        let _ = body.append(data, true);
        body
    }

    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn max_content_length(&self) -> u64 {
        self.max_content_length
    }

    /// Bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.state.lock().received
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.state.lock().trailers.clone()
    }

    /// Append one chunk; `last` marks the end of the body.
    pub fn append(&self, data: Bytes, last: bool) -> Result<(), HttpError> {
        self.push(data, last, None)
    }

    /// Append the final chunk together with trailing headers.
    pub fn append_final(&self, data: Bytes, trailers: HeaderMap) -> Result<(), HttpError> {
        self.push(data, true, Some(trailers))
    }

    /// Fail the body from outside, e.g. when the connection drops.
    pub fn fail(&self, error: HttpError) {
        let mut state = self.state.lock();
        if state.finished || state.failed.is_some() {
            return;
        }
        self.fail_locked(&mut state, error);
    }

    fn push(&self, data: Bytes, last: bool, trailers: Option<HeaderMap>) -> Result<(), HttpError> {
        let mut state = self.state.lock();
        if let Some(failed) = &state.failed {
            return Err(failed.clone());
        }
        if state.finished {
            warn!("chunk received after the body completed");
            return Err(HttpError::internal("Request body already complete"));
        }

        state.received += data.len() as u64;
        if state.received > self.max_content_length {
            let error = HttpError::payload_too_large(self.max_content_length);
            debug!(
                received = state.received,
                limit = self.max_content_length,
                "request body exceeds limit"
            );
            self.fail_locked(&mut state, error.clone());
            return Err(error);
        }

        state.buffer.push(data);
        if last {
            state.finished = true;
            state.trailers = trailers;
        }

        let BodyState {
            buffer, reader, ..
        } = &mut *state;
        if let Some(active) = reader.as_mut() {
            match active.on_data(buffer, last) {
                Ok(true) => *reader = None,
                Ok(false) => {}
                Err(error) => {
                    self.fail_locked(&mut state, error.clone());
                    return Err(error);
                }
            }
        }

        if last {
            self.outcome.send_replace(Some(Ok(state.buffer.to_bytes())));
        }
        Ok(())
    }

    fn fail_locked(&self, state: &mut BodyState, error: HttpError) {
        state.buffer.clear();
        state.failed = Some(error.clone());
        if let Some(reader) = state.reader.take() {
            reader.on_error(error.clone());
        }
        self.outcome.send_replace(Some(Err(error)));
    }

    /// Attach the one incremental reader this body supports.
    ///
    /// `read` is called with the buffer and an end-of-body flag after every
    /// append (and right away if data is already buffered). It returns
    /// `Ok(None)` to ask for more data; returning `None` for the final chunk
    /// fails the read with `400`.
    pub fn read_async<T, F>(&self, read: F) -> Result<PendingRead<T>, HttpError>
    where
        T: Send + 'static,
        F: FnMut(&mut CompositeBuffer, bool) -> Result<Option<T>, HttpError> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.reader_attached {
            return Err(HttpError::internal(
                "A reader is already attached to this request body",
            ));
        }
        state.reader_attached = true;

        let (tx, rx) = oneshot::channel();
        let mut reader: Box<dyn BodyReader> = Box::new(PendingReader {
            read,
            resolve: Some(tx),
        });

        if let Some(failed) = state.failed.clone() {
            reader.on_error(failed);
            return Ok(PendingRead { rx });
        }
        let finished = state.finished;
        if !state.buffer.is_empty() || finished {
            match reader.on_data(&mut state.buffer, finished) {
                Ok(true) => return Ok(PendingRead { rx }),
                Ok(false) => {}
                Err(error) => {
                    state.reader = Some(reader);
                    self.fail_locked(&mut state, error);
                    return Ok(PendingRead { rx });
                }
            }
        }
        state.reader = Some(reader);
        Ok(PendingRead { rx })
    }

    /// Wait for the whole body.
    pub async fn bytes(&self) -> Result<Bytes, HttpError> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| HttpError::internal("Request body was dropped"))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(HttpError::internal("Request body was dropped")),
        }
    }

    /// Wait for the whole body as UTF-8.
    pub async fn text(&self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| HttpError::bad_request("Request body is not valid UTF-8"))
    }
}

impl fmt::Debug for StreamingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamingBody")
            .field("max_content_length", &self.max_content_length)
            .field("received", &state.received)
            .field("finished", &state.finished)
            .field("failed", &state.failed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    #[tokio::test]
    async fn test_bytes_resolve_on_final_chunk() {
        let body = StreamingBody::new(64);
        body.append(Bytes::from_static(b"hello "), false).unwrap();
        assert!(!body.is_complete());
        body.append(Bytes::from_static(b"world"), true).unwrap();
        assert_eq!(body.bytes().await.unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(body.received(), 11);
    }

    #[tokio::test]
    async fn test_size_cap_rejects_crossing_chunk_and_after() {
        let body = StreamingBody::new(10);
        body.append(Bytes::from_static(b"12345"), false).unwrap();
        body.append(Bytes::from_static(b"12345"), false).unwrap();
        let error = body.append(Bytes::from_static(b"1"), false).unwrap_err();
        assert_eq!(error.status, StatusCode::PAYLOAD_TOO_LARGE);

        let later = body.append(Bytes::from_static(b""), true).unwrap_err();
        assert_eq!(later.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body.bytes().await.unwrap_err().status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_reader_consumes_incrementally() {
        let body = StreamingBody::new(1024);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        let pending = body
            .read_async(move |buffer, _last| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if buffer.remaining() < 4 {
                    return Ok(None);
                }
                Ok(Some(buffer.get_u32()))
            })
            .unwrap();

        body.append(Bytes::from_static(&[0, 0]), false).unwrap();
        body.append(Bytes::from_static(&[1, 2, 9]), false).unwrap();
        assert_eq!(pending.await.unwrap(), 0x0000_0102);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        body.append(Bytes::new(), true).unwrap();
        assert_eq!(body.bytes().await.unwrap(), Bytes::from_static(&[9]));
    }

    #[tokio::test]
    async fn test_second_reader_fails_fast() {
        let body = StreamingBody::new(16);
        let _first = body.read_async(|_, _| Ok(Some(()))).unwrap();
        assert!(body.read_async(|_, _| Ok(Some(()))).is_err());
    }

    #[tokio::test]
    async fn test_reader_needing_more_at_end_fails() {
        let body = StreamingBody::new(16);
        let pending = body
            .read_async(|_: &mut CompositeBuffer, _| Ok::<Option<u8>, HttpError>(None))
            .unwrap();
        body.append(Bytes::from_static(b"ab"), true).unwrap();
        assert_eq!(pending.await.unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reader_sees_overflow() {
        let body = StreamingBody::new(2);
        let pending = body
            .read_async(|_: &mut CompositeBuffer, _| Ok::<Option<u8>, HttpError>(None))
            .unwrap();
        assert!(body.append(Bytes::from_static(b"abc"), false).is_err());
        assert_eq!(
            pending.await.unwrap_err().status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_panicking_reader_fails_the_body_with_500() {
        let body = StreamingBody::new(16);
        let pending = body
            .read_async(|buffer: &mut CompositeBuffer, _| -> Result<Option<u8>, HttpError> {
                if buffer.remaining() > 1 {
                    panic!("reader bug");
                }
                Ok(None)
            })
            .unwrap();

        body.append(Bytes::from_static(b"a"), false).unwrap();
        let error = body.append(Bytes::from_static(b"b"), true).unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);

        let read = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .expect("reader must resolve");
        assert_eq!(read.unwrap_err().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.is_complete());
        assert_eq!(
            body.bytes().await.unwrap_err().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(body.append(Bytes::from_static(b"c"), true).is_err());
    }

    #[tokio::test]
    async fn test_reader_panicking_on_buffered_data_fails_at_attach() {
        let body = StreamingBody::new(16);
        body.append(Bytes::from_static(b"ab"), false).unwrap();
        let pending = body
            .read_async(|_: &mut CompositeBuffer, _| -> Result<Option<u8>, HttpError> {
                panic!("reader bug")
            })
            .unwrap();
        assert_eq!(
            pending.await.unwrap_err().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(body.is_complete());
    }

    #[tokio::test]
    async fn test_trailers_captured() {
        let body = StreamingBody::new(16);
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());
        body.append_final(Bytes::from_static(b"data"), trailers)
            .unwrap();
        assert_eq!(body.trailers().unwrap()["x-checksum"], "abc");
    }

    #[test]
    fn test_composite_buffer_reads_across_chunks() {
        let mut buffer = CompositeBuffer::new();
        buffer.push(Bytes::from_static(b"ab"));
        buffer.push(Bytes::from_static(b"cd"));
        buffer.advance(3);
        assert_eq!(buffer.chunk(), b"d");
        assert_eq!(buffer.remaining(), 1);

        let mut buffer = CompositeBuffer::new();
        for chunk in [&b"abc"[..], b"de", b"fgh"] {
            buffer.push(Bytes::copy_from_slice(chunk));
        }
        let tail: Vec<&[u8]> = buffer.slices_from(4).collect();
        assert_eq!(tail, vec![&b"e"[..], b"fgh"]);
        assert_eq!(buffer.slices_from(8).count(), 0);
    }
}
