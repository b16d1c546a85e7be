//! JSON and plain text body codecs.
use bytes::Bytes;
use mime::Mime;
use serde_json::{Deserializer, Value};

use crate::{
    core::{
        body::{CompositeBuffer, PendingRead, StreamingBody},
        codec::BodyCodecs,
        error::HttpError,
    },
    ports::body_codec::BodyCodec,
};

/// JSON first, then text.
pub fn standard_codecs() -> BodyCodecs {
    BodyCodecs::new().with(JsonCodec).with(TextCodec)
}

fn is_json(mime: &Mime) -> bool {
    mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON)
}

/// Parses JSON while the body is still arriving.
///
/// Each byte is scanned once as it arrives. An object, array or string is
/// parsed as soon as its closing byte is seen and later bytes are only
/// checked to be whitespace, but the value is handed over at the end of the
/// body: trailing data is a `400` however the body was chunked. Scalars are
/// parsed at the end since `12` may still become `123`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

fn trailing_data() -> HttpError {
    HttpError::bad_request("Malformed JSON body: trailing characters after value")
}

fn malformed(e: serde_json::Error) -> HttpError {
    HttpError::bad_request(format!("Malformed JSON body: {e}"))
}

/// Scan state carried between chunks of one body.
#[derive(Debug, Default)]
struct JsonParse {
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// The top-level value is a bare scalar; nothing to do before the end.
    scalar: bool,
    /// Offset just past the first value once it is closed.
    end: Option<usize>,
    value: Option<Value>,
}

impl JsonParse {
    fn scan(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        for &byte in bytes {
            if self.scalar {
                return Ok(());
            }
            let offset = self.scanned;
            self.scanned += 1;

            if self.end.is_some() {
                if !byte.is_ascii_whitespace() {
                    return Err(trailing_data());
                }
                continue;
            }
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => {
                        self.in_string = false;
                        if self.depth == 0 {
                            self.end = Some(offset + 1);
                        }
                    }
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' if self.depth == 0 => {
                    return Err(HttpError::bad_request(
                        "Malformed JSON body: unbalanced closing bracket",
                    ));
                }
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.end = Some(offset + 1);
                    }
                }
                _ if byte.is_ascii_whitespace() => {}
                _ if self.depth == 0 => self.scalar = true,
                _ => {}
            }
        }
        Ok(())
    }

    fn feed(&mut self, buffer: &mut CompositeBuffer, last: bool) -> Result<Option<Value>, HttpError> {
        for slice in buffer.slices_from(self.scanned) {
            self.scan(slice)?;
        }
        if let Some(end) = self.end.filter(|_| self.value.is_none()) {
            let data = buffer.to_bytes();
            self.value = Some(serde_json::from_slice(&data[..end]).map_err(malformed)?);
        }
        if !last {
            return Ok(None);
        }
        if let Some(value) = self.value.take() {
            return Ok(Some(value));
        }

        // scalar, or a value the body ended in the middle of
        let data = buffer.to_bytes();
        let mut values = Deserializer::from_slice(&data).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                if data[values.byte_offset()..].iter().all(u8::is_ascii_whitespace) {
                    Ok(Some(value))
                } else {
                    Err(trailing_data())
                }
            }
            Some(Err(e)) => Err(malformed(e)),
            None => Err(HttpError::bad_request("Request body is empty")),
        }
    }
}

impl BodyCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    /// Bodies without a content type are read as JSON.
    fn can_read(&self, content_type: Option<&Mime>) -> bool {
        content_type.is_none_or(is_json)
    }

    fn can_write(&self, accept: Option<&Mime>) -> bool {
        match accept {
            None => true,
            Some(mime) => {
                is_json(mime)
                    || (mime.type_() == mime::STAR && mime.subtype() == mime::STAR)
                    || (mime.type_() == mime::APPLICATION && mime.subtype() == mime::STAR)
            }
        }
    }

    fn read(&self, body: &StreamingBody) -> Result<PendingRead<Value>, HttpError> {
        let mut parse = JsonParse::default();
        body.read_async(move |buffer, last| parse.feed(buffer, last))
    }

    fn write(&self, value: &Value) -> Result<(Bytes, Mime), HttpError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| HttpError::internal(format!("Failed to encode JSON: {e}")))?;
        Ok((Bytes::from(encoded), mime::APPLICATION_JSON))
    }
}

/// Whole body as a UTF-8 string value.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl BodyCodec for TextCodec {
    fn name(&self) -> &str {
        "text"
    }

    fn can_read(&self, content_type: Option<&Mime>) -> bool {
        content_type.is_some_and(|mime| mime.type_() == mime::TEXT)
    }

    fn can_write(&self, accept: Option<&Mime>) -> bool {
        accept.is_some_and(|mime| {
            (mime.type_() == mime::TEXT
                && (mime.subtype() == mime::PLAIN || mime.subtype() == mime::STAR))
                || (mime.type_() == mime::STAR && mime.subtype() == mime::STAR)
        })
    }

    fn read(&self, body: &StreamingBody) -> Result<PendingRead<Value>, HttpError> {
        body.read_async(|buffer, last| {
            if !last {
                return Ok(None);
            }
            let text = String::from_utf8(buffer.to_bytes().to_vec())
                .map_err(|_| HttpError::bad_request("Request body is not valid UTF-8"))?;
            Ok(Some(Value::String(text)))
        })
    }

    /// Strings are written as-is, anything else as its JSON text.
    fn write(&self, value: &Value) -> Result<(Bytes, Mime), HttpError> {
        let text = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Ok((Bytes::from(text), mime::TEXT_PLAIN_UTF_8))
    }
}
