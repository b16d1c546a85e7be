use bytes::Bytes;
use mime::Mime;
use serde_json::Value;

use crate::core::{
    body::{PendingRead, StreamingBody},
    error::HttpError,
};

/// BodyCodec defines the port (interface) for turning request bodies into
/// values and values into response bytes
///
/// Values cross the port as [`serde_json::Value`]; typed conversion on either
/// side is done by the codec registry.
pub trait BodyCodec: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether this codec reads bodies of the given content type
    fn can_read(&self, content_type: Option<&Mime>) -> bool;

    /// Whether this codec can produce the given accepted type
    fn can_write(&self, accept: Option<&Mime>) -> bool;

    /// Attach an incremental reader to the body
    fn read(&self, body: &StreamingBody) -> Result<PendingRead<Value>, HttpError>;

    /// Encode a value, returning the bytes and their content type
    fn write(&self, value: &Value) -> Result<(Bytes, Mime), HttpError>;
}
