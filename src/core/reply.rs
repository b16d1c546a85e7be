//! What handlers and filters return: a pipeline that eventually produces one
//! [`Response`].
use std::{future::Future, sync::Arc};

use tracing::Instrument;

use super::{error::HttpError, response::Response};
use crate::reactive::{Flo, FlowError, LastValueSink, Publisher};

pub struct Reply {
    publisher: Arc<dyn Publisher<Response>>,
}

impl Reply {
    /// Reply that is already known.
    pub fn response(response: Response) -> Self {
        Self::from_flo(Flo::just(response))
    }

    pub fn error(error: impl Into<FlowError>) -> Self {
        let flo = Flo::new();
        flo.emitter().error(error.into());
        Self::from_flo(flo)
    }

    pub fn from_flo<I: Send + 'static>(flo: Flo<I, Response>) -> Self {
        Self {
            publisher: flo.into_publisher(),
        }
    }

    pub fn from_publisher(publisher: Arc<dyn Publisher<Response>>) -> Self {
        Self { publisher }
    }

    /// Reply produced by a future, spawned on the current tokio runtime.
    pub fn from_future<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<Response, E>> + Send + 'static,
        E: Into<FlowError> + Send + 'static,
    {
        let flo = Flo::new();
        let emitter = flo.emitter();
        tokio::spawn(
            async move {
                match future.await {
                    Ok(response) => {
                        emitter.emit(response);
                        emitter.done();
                    }
                    Err(error) => emitter.error(error.into()),
                }
            }
            .in_current_span(),
        );
        Self::from_flo(flo)
    }

    pub fn into_publisher(self) -> Arc<dyn Publisher<Response>> {
        self.publisher
    }

    /// Run the pipeline and take the last response it produced.
    pub async fn resolve(self) -> Result<Response, FlowError> {
        let (sink, outcome) = LastValueSink::new();
        self.publisher.subscribe(sink);
        match outcome.await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(HttpError::internal("Handler completed without a response").into()),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(FlowError::Abandoned),
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::response(response)
    }
}

impl From<HttpError> for Reply {
    fn from(error: HttpError) -> Self {
        Reply::error(error)
    }
}
