//! Priority ordered body codec selection.
use std::sync::Arc;

use http::{HeaderValue, StatusCode, header};
use mime::Mime;
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use super::{error::HttpError, request::Request, response::Response};
use crate::ports::body_codec::BodyCodec;

/// Registered codecs, tried in registration order.
#[derive(Clone, Default)]
pub struct BodyCodecs {
    codecs: Vec<Arc<dyn BodyCodec>>,
}

impl BodyCodecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, codec: impl BodyCodec) -> Self {
        self.codecs.push(Arc::new(codec));
        self
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Read the request body as `T` with the first codec that accepts its
    /// `Content-Type`. No codec is `415`; a value that does not fit `T` is `400`.
    pub async fn read<T: DeserializeOwned>(&self, request: &Request) -> Result<T, HttpError> {
        let content_type = request.content_type();
        let codec = self
            .codecs
            .iter()
            .find(|codec| codec.can_read(content_type.as_ref()))
            .ok_or_else(|| {
                HttpError::unsupported_media_type(format!(
                    "No reader for content type {}",
                    content_type
                        .as_ref()
                        .map(Mime::to_string)
                        .unwrap_or_else(|| "(none)".to_string())
                ))
            })?;
        debug!(codec = codec.name(), "reading request body");

        let value = codec.read(request.body())?.await?;
        serde_json::from_value(value)
            .map_err(|e| HttpError::bad_request(format!("Malformed request body: {e}")))
    }

    /// Encode `value` into a `200` response with the first codec able to
    /// produce one of the accepted types, in the order the client listed them.
    /// Nothing acceptable is `406`.
    pub fn write<T: Serialize>(&self, value: &T, accept: Option<&str>) -> Result<Response, HttpError> {
        let accepted: Vec<Mime> = accept
            .map(|raw| {
                raw.split(',')
                    .filter_map(|item| item.trim().parse::<Mime>().ok())
                    .collect()
            })
            .unwrap_or_default();

        let codec = if accepted.is_empty() {
            self.codecs.iter().find(|codec| codec.can_write(None))
        } else {
            accepted.iter().find_map(|mime| {
                self.codecs
                    .iter()
                    .find(|codec| codec.can_write(Some(mime)))
            })
        }
        .ok_or_else(|| {
            HttpError::new(
                StatusCode::NOT_ACCEPTABLE,
                format!("No writer for {}", accept.unwrap_or("(any)")),
            )
        })?;

        let value = serde_json::to_value(value)
            .map_err(|e| HttpError::internal(format!("Failed to serialize response: {e}")))?;
        let (bytes, mime) = codec.write(&value)?;
        let content_type = HeaderValue::from_str(mime.as_ref())
            .map_err(|e| HttpError::internal(format!("Invalid content type {mime}: {e}")))?;
        Ok(Response::ok()
            .with_header(header::CONTENT_TYPE, content_type)
            .with_body(bytes))
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;

    #[tokio::test]
    async fn test_empty_registry_refuses() {
        let codecs = BodyCodecs::new();
        let request = Request::parse(Method::POST, "/x").unwrap();
        let error = codecs.read::<String>(&request).await.unwrap_err();
        assert_eq!(error.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let error = codecs.write(&"hi", Some("text/plain")).unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_ACCEPTABLE);
    }
}
