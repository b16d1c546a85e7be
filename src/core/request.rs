use std::{collections::HashMap, str::FromStr, sync::Arc};

use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, header};
use tracing::warn;
use url::form_urlencoded;
use uuid::Uuid;

use super::{
    attributes::{Attributes, PATH_OVERRIDE},
    body::StreamingBody,
    error::HttpError,
    trace::RouteTrace,
};

/// Inbound request: head, request-scoped attributes and a handle to the
/// streaming body. Cloning is cheap apart from the header map; clones share
/// attributes, body and trace.
#[derive(Debug, Clone)]
pub struct Request {
    id: Uuid,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    attributes: Attributes,
    body: Arc<StreamingBody>,
    path_params: HashMap<String, String>,
    trace: RouteTrace,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            uri,
            headers: HeaderMap::new(),
            attributes: Attributes::new(),
            body: Arc::new(StreamingBody::empty()),
            path_params: HashMap::new(),
            trace: RouteTrace::default(),
        }
    }

    /// Request with a `path[?query]` string; unparsable input is a `400`.
    pub fn parse(method: Method, uri: &str) -> Result<Self, HttpError> {
        let uri = uri
            .parse::<Uri>()
            .map_err(|e| HttpError::bad_request(format!("Invalid request URI '{uri}': {e}")))?;
        Ok(Self::new(method, uri))
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Arc<StreamingBody>) -> Self {
        self.body = body;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<mime::Mime> {
        self.header(header::CONTENT_TYPE)
            .and_then(|value| value.parse().ok())
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn body(&self) -> &Arc<StreamingBody> {
        &self.body
    }

    pub fn trace(&self) -> &RouteTrace {
        &self.trace
    }

    pub(crate) fn set_trace(&mut self, trace: RouteTrace) {
        self.trace = trace;
    }

    /// Path used for matching: the [`PATH_OVERRIDE`] attribute if a filter
    /// set one, otherwise the URI path.
    ///
    /// An override stored as anything but a `String` is a `500`, not a
    /// silent fall back to the URI path.
    pub fn routing_path(&self) -> Result<String, HttpError> {
        match self.attributes.find::<String>(PATH_OVERRIDE) {
            Ok(Some(path)) => Ok(path),
            Ok(None) => Ok(self.uri.path().to_string()),
            Err(e) => {
                warn!(error = %e, "unusable routing path override");
                Err(HttpError::internal(format!("Invalid routing path override: {e}")))
            }
        }
    }

    /// Route on `path` instead of the URI path from here on.
    pub fn set_routing_path(&self, path: impl Into<String>) {
        self.attributes.set(PATH_OVERRIDE, path.into());
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    pub(crate) fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Path parameter converted with `FromStr`; missing or unparsable is a `400`.
    pub fn param_as<T: FromStr>(&self, name: &str) -> Result<T, HttpError> {
        let raw = self
            .param(name)
            .ok_or_else(|| HttpError::bad_request(format!("Missing path parameter '{name}'")))?;
        raw.parse::<T>().map_err(|_| {
            HttpError::bad_request(format!("Invalid value '{raw}' for path parameter '{name}'"))
        })
    }

    /// Decoded query parameters (`+` is a space); the last occurrence of a
    /// key wins.
    pub fn query_params(&self) -> HashMap<String, String> {
        let Some(query) = self.uri.query() else {
            return HashMap::new();
        };
        form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params().remove(name)
    }
}
