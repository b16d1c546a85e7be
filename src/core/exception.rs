//! Turning pipeline failures into responses.
use std::sync::Arc;

use http::StatusCode;
use tracing::{error, warn};

use super::{error::HttpError, response::Response};
use crate::reactive::FlowError;

/// Maps an error to a response, or declines with `None`.
pub trait ExceptionHandler: Send + Sync + 'static {
    fn handle(&self, error: &FlowError) -> Option<Response>;
}

impl<F> ExceptionHandler for F
where
    F: Fn(&FlowError) -> Option<Response> + Send + Sync + 'static,
{
    fn handle(&self, error: &FlowError) -> Option<Response> {
        self(error)
    }
}

/// Tries each registered handler in order; the built-in fallback answers
/// whatever they decline.
///
/// The fallback walks the cause chain for an [`HttpError`] and uses its
/// status; otherwise argument-style failures are `400` and everything else
/// `500`. The body is the error message.
#[derive(Clone, Default)]
pub struct CompositeExceptionHandler {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl CompositeExceptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl ExceptionHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn respond(&self, error: &FlowError) -> Response {
        self.handlers
            .iter()
            .find_map(|handler| handler.handle(error))
            .unwrap_or_else(|| fallback(error))
    }
}

impl ExceptionHandler for CompositeExceptionHandler {
    fn handle(&self, error: &FlowError) -> Option<Response> {
        Some(self.respond(error))
    }
}

/// Status a failure should be answered with.
pub fn status_for(error: &FlowError) -> StatusCode {
    if let Some(http) = error.find_cause::<HttpError>() {
        http.status
    } else if error.is_bad_argument() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn fallback(error: &FlowError) -> Response {
    let status = status_for(error);
    let message = match error.find_cause::<HttpError>() {
        Some(http) => http.message.clone(),
        None => error.to_string(),
    };
    if status.is_server_error() {
        error!(%status, error = %error, "request failed");
    } else {
        warn!(%status, error = %error, "request rejected");
    }
    Response::text(status, message)
}
