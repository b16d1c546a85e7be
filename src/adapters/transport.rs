//! axum/hyper bridge.
//!
//! Inbound bodies are pumped frame by frame into a [`StreamingBody`] while the
//! router already runs, so handlers can parse incrementally. Outbound bodies
//! are written through a [`ResponseChannel`] backed by a bounded channel that
//! hyper drains as the peer accepts data.
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{Body as AxumBody, HttpBody},
    extract::Request as AxumRequest,
    routing::any,
};
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, header};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::{
    core::{
        body::StreamingBody,
        error::HttpError,
        request::Request as RoutedRequest,
        response::Response as RoutedResponse,
        response_body::{ResponseBody, resolve_within_root},
        router::Router,
    },
    ports::transport::{ResponseChannel, TransportError, TransportResult},
};

/// Chunks buffered between the body writer and hyper
const CHANNEL_CAPACITY: usize = 16;

/// HTTP front for a [`Router`]
#[derive(Clone)]
pub struct HttpBridge {
    router: Router,
    max_content_length: u64,
}

impl HttpBridge {
    pub fn new(router: Router, max_content_length: u64) -> Self {
        Self {
            router,
            max_content_length,
        }
    }

    /// Dispatch one request through the router
    pub async fn handle_request(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let (parts, body) = req.into_parts();
        let is_head = parts.method == Method::HEAD;

        tracing::debug!("Handling {} request to {}", parts.method, parts.uri.path());

        let streaming = Arc::new(StreamingBody::new(self.max_content_length));
        tokio::spawn(pump_body(body, streaming.clone()).in_current_span());

        let request = RoutedRequest::new(parts.method, parts.uri)
            .with_headers(parts.headers)
            .with_body(streaming);
        let response = self.router.dispatch(request).await;
        into_http_response(response, is_head).await
    }

    /// axum router sending every path and method through the bridge
    pub fn into_axum_router(self) -> axum::Router {
        let bridge = Arc::new(self);
        let make_route = |bridge: Arc<HttpBridge>| {
            any(move |req: AxumRequest| {
                let bridge = bridge.clone();
                async move { bridge.handle_request(req).await }
            })
        };
        axum::Router::new()
            .route("/", make_route(bridge.clone()))
            .route("/{*path}", make_route(bridge))
    }
}

/// Copy inbound frames into the streaming body until it ends or refuses more.
async fn pump_body(mut body: AxumBody, target: Arc<StreamingBody>) {
    loop {
        match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => {
                    let last = body.is_end_stream();
                    if target.append(data, last).is_err() || last {
                        return;
                    }
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        let _ = target.append_final(Bytes::new(), trailers);
                        return;
                    }
                }
            },
            Some(Err(e)) => {
                tracing::debug!("Request body read failed: {}", e);
                target.fail(HttpError::bad_request(format!(
                    "Failed to read request body: {e}"
                )));
                return;
            }
            None => {
                if !target.is_complete() {
                    let _ = target.append(Bytes::new(), true);
                }
                return;
            }
        }
    }
}

fn plain(status: StatusCode, message: String) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Open file bodies before committing to a status, so a missing or
/// out-of-root file is answered with 404/403 rather than a broken 200.
async fn open_file_body(body: ResponseBody) -> Result<(ResponseBody, Option<u64>), Response<AxumBody>> {
    let ResponseBody::File { root, path } = body else {
        let length = body.content_length();
        return Ok((body, length));
    };
    let resolved = resolve_within_root(&root, &path).map_err(|e| match e {
        TransportError::PathTraversal(p) => plain(StatusCode::FORBIDDEN, format!("Access denied: {p}")),
        TransportError::NotFound(p) => plain(StatusCode::NOT_FOUND, format!("File not found: {p}")),
        other => {
            tracing::error!("Failed to resolve file body: {}", other);
            plain(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    })?;
    let file = tokio::fs::File::open(&resolved)
        .await
        .map_err(|e| plain(StatusCode::NOT_FOUND, format!("File not found: {path} ({e})")))?;
    let length = file.metadata().await.ok().map(|m| m.len());
    Ok((ResponseBody::reader(file), length))
}

async fn into_http_response(response: RoutedResponse, is_head: bool) -> Response<AxumBody> {
    let (status, headers, body) = response.into_parts();
    let (body, length) = match open_file_body(body).await {
        Ok(opened) => opened,
        Err(refused) => return refused,
    };

    let http_body = if is_head || body.is_empty() {
        AxumBody::empty()
    } else {
        match body {
            ResponseBody::Bytes(bytes) => AxumBody::from(bytes),
            streamed => {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                tokio::spawn(
                    async move {
                        let mut channel = StreamChannel { tx };
                        match streamed.write_to(&mut channel).await {
                            Ok(written) => tracing::debug!("Response body written: {} bytes", written),
                            Err(e) => {
                                tracing::warn!("Response body failed mid-stream: {}", e);
                                let _ = channel.tx.send(Err(e)).await;
                            }
                        }
                    }
                    .in_current_span(),
                );
                AxumBody::from_stream(ReceiverStream::new(rx))
            }
        }
    };

    let mut out = Response::new(http_body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    if let Some(length) = length {
        if !out.headers().contains_key(header::CONTENT_LENGTH) {
            out.headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
    }
    out
}

/// Body chunks handed to hyper through a bounded channel
struct StreamChannel {
    tx: mpsc::Sender<Result<Bytes, TransportError>>,
}

#[async_trait]
impl ResponseChannel for StreamChannel {
    async fn write(&mut self, chunk: Bytes) -> TransportResult<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// hyper flushes as it polls the stream
    async fn flush(&mut self) -> TransportResult<()> {
        if self.tx.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::{
        core::{handler::async_handler, reply::Reply},
        reactive::Flo,
    };

    async fn body_string(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn app(router: Router, max: u64) -> axum::Router {
        HttpBridge::new(router, max).into_axum_router()
    }

    #[tokio::test]
    async fn test_round_trip_with_streamed_request_body() {
        let router = Router::builder()
            .post(
                "/echo",
                async_handler(|req: RoutedRequest| async move {
                    let text = req.body().text().await?;
                    Ok::<_, HttpError>(RoutedResponse::text(StatusCode::OK, text.to_uppercase()))
                }),
            )
            .build()
            .unwrap();

        let response = app(router, 1024)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .body(AxumBody::from("quiet"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "QUIET");
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let router = Router::builder()
            .post(
                "/upload",
                async_handler(|req: RoutedRequest| async move {
                    let bytes = req.body().bytes().await?;
                    Ok::<_, HttpError>(RoutedResponse::text(StatusCode::OK, bytes.len().to_string()))
                }),
            )
            .build()
            .unwrap();

        let response = app(router, 4)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/upload")
                    .body(AxumBody::from("too long"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_stream_body_and_head_suppression() {
        let router = Router::builder()
            .get("/chunks", |_req: RoutedRequest| {
                let chunks = Flo::from_iter(["a", "b", "c"]).map(Bytes::from);
                Reply::response(
                    RoutedResponse::ok().with_body(ResponseBody::stream(chunks.into_publisher())),
                )
            })
            .build()
            .unwrap();
        let app = app(router, 16);

        let get = app
            .clone()
            .oneshot(Request::get("/chunks").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_string(get).await, "abc");

        let head = app
            .oneshot(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/chunks")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(body_string(head).await, "");
    }

    #[tokio::test]
    async fn test_file_bodies_are_checked_before_headers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi there").unwrap();
        let root = dir.path().to_path_buf();

        let router = Router::builder()
            .get("/files/*", move |req: RoutedRequest| {
                let path = req.param("_wildcard").unwrap_or_default().to_string();
                Reply::response(RoutedResponse::ok().with_body(ResponseBody::file(root.clone(), path)))
            })
            .build()
            .unwrap();
        let app = app(router, 16);

        let found = app
            .clone()
            .oneshot(Request::get("/files/hello.txt").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(found.headers()[header::CONTENT_LENGTH], "8");
        assert_eq!(body_string(found).await, "hi there");

        let missing = app
            .oneshot(Request::get("/files/nope.txt").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
