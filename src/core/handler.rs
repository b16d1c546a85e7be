use std::{future::Future, marker::PhantomData};

use http::StatusCode;

use super::{error::HttpError, reply::Reply, request::Request, response::Response};
use crate::reactive::FlowError;

/// Produces the reply for a matched route.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Reply;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Reply + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Reply {
        self(request)
    }
}

/// Handler backed by an async closure.
pub struct AsyncHandler<F, Fut, E> {
    f: F,
    _marker: PhantomData<fn() -> (Fut, E)>,
}

/// Wrap an async closure as a [`Handler`].
pub fn async_handler<F, Fut, E>(f: F) -> AsyncHandler<F, Fut, E>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, E>> + Send + 'static,
    E: Into<FlowError> + Send + 'static,
{
    AsyncHandler {
        f,
        _marker: PhantomData,
    }
}

impl<F, Fut, E> Handler for AsyncHandler<F, Fut, E>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, E>> + Send + 'static,
    E: Into<FlowError> + Send + 'static,
{
    fn handle(&self, request: Request) -> Reply {
        Reply::from_future((self.f)(request))
    }
}

/// Answers `404` with the unmatched path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl Handler for NotFound {
    fn handle(&self, request: Request) -> Reply {
        Reply::response(Response::from_error(&HttpError::new(
            StatusCode::NOT_FOUND,
            format!("No route for {} {}", request.method(), request.path()),
        )))
    }
}
