//! Filter and route dispatch.
//!
//! Routes and filters are registered on a [`RouterBuilder`] and frozen by
//! [`RouterBuilder::build`], which fails on any bad template or duplicate
//! registration. Per request the matching filters run in priority order
//! (lower first); when they are exhausted the handler is chosen from the
//! routes for the exact method, then routes registered for any method, then
//! the not-found handler. Candidates are tried in specificity order.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Instant,
};

use http::Method;
use tracing::{Instrument, debug, error, info};

use super::{
    error::RouterError,
    exception::{CompositeExceptionHandler, ExceptionHandler},
    filter::{Filter, FilterChain},
    handler::{Handler, NotFound},
    path_spec::PathSpec,
    reply::Reply,
    request::Request,
    response::Response,
    trace::RouteTrace,
};
use crate::{
    reactive::{FlowError, error::panic_message},
    tracing_setup::create_request_span,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteMethod {
    Exact(Method),
    /// Matches every method, after exact-method routes.
    Any,
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMethod::Exact(method) => write!(f, "{method}"),
            RouteMethod::Any => f.write_str("ANY"),
        }
    }
}

impl From<Method> for RouteMethod {
    fn from(method: Method) -> Self {
        RouteMethod::Exact(method)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterOptions {
    /// Compile every template case-insensitively.
    pub case_insensitive: bool,
    /// Record a trace entry per evaluation and return them as headers.
    pub debug_routing: bool,
}

pub(crate) struct FilterEntry {
    pub(crate) spec: PathSpec,
    pub(crate) priority: i32,
    pub(crate) filter: Arc<dyn Filter>,
}

struct RouteEntry {
    spec: PathSpec,
    method: RouteMethod,
    handler: Arc<dyn Handler>,
}

pub(crate) struct RouterInner {
    filters: Vec<FilterEntry>,
    routes: HashMap<Method, Vec<RouteEntry>>,
    any_routes: Vec<RouteEntry>,
    not_found: Arc<dyn Handler>,
    exceptions: CompositeExceptionHandler,
    options: RouterOptions,
}

impl RouterInner {
    pub(crate) fn filters(&self) -> &[FilterEntry] {
        &self.filters
    }

    pub(crate) fn route(&self, mut request: Request) -> Reply {
        let path = match request.routing_path() {
            Ok(path) => path,
            Err(e) => return Reply::error(e),
        };
        let candidates = self
            .routes
            .get(request.method())
            .into_iter()
            .flatten()
            .chain(self.any_routes.iter());

        for entry in candidates {
            match entry.spec.match_and_collect(&path) {
                Some(params) => {
                    request
                        .trace()
                        .record(|| format!("route {} {} matched {path}", entry.method, entry.spec));
                    request.set_path_params(params);
                    let handler = entry.handler.clone();
                    return guarded(|| handler.handle(request));
                }
                None => request
                    .trace()
                    .record(|| format!("route {} {} skipped {path}", entry.method, entry.spec)),
            }
        }

        request
            .trace()
            .record(|| format!("no route for {} {path}", request.method()));
        let not_found = self.not_found.clone();
        guarded(|| not_found.handle(request))
    }
}

/// Run filter or handler code, turning a panic into an error reply.
pub(crate) fn guarded(f: impl FnOnce() -> Reply) -> Reply {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(reply) => reply,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "handler panicked");
            Reply::error(FlowError::Panicked(message))
        }
    }
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn options(&self) -> RouterOptions {
        self.inner.options
    }

    pub fn route_count(&self) -> usize {
        self.inner.routes.values().map(Vec::len).sum::<usize>() + self.inner.any_routes.len()
    }

    pub fn filter_count(&self) -> usize {
        self.inner.filters.len()
    }

    /// Run filters and the selected handler, resolving to one response.
    /// Failures become responses through the exception handlers.
    pub async fn dispatch(&self, mut request: Request) -> Response {
        let started = Instant::now();
        let span = create_request_span(
            request.method().as_str(),
            request.path(),
            &request.id().to_string(),
        );
        let trace = RouteTrace::new(self.inner.options.debug_routing);
        request.set_trace(trace.clone());

        let reply = span.in_scope(|| FilterChain::start(self.inner.clone()).next(request));
        let outcome = reply.resolve().instrument(span.clone()).await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(error) => span.in_scope(|| self.inner.exceptions.respond(&error)),
        };
        trace.apply(response.headers_mut());

        let elapsed = started.elapsed().as_millis() as u64;
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", elapsed);
        span.in_scope(|| debug!(status = %response.status(), elapsed_ms = elapsed, "request dispatched"));
        response
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.route_count())
            .field("filters", &self.filter_count())
            .field("options", &self.inner.options)
            .finish()
    }
}

pub struct RouterBuilder {
    options: RouterOptions,
    routes: Vec<(RouteMethod, String, Arc<dyn Handler>)>,
    filters: Vec<(String, i32, Arc<dyn Filter>)>,
    not_found: Option<Arc<dyn Handler>>,
    exceptions: CompositeExceptionHandler,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            options: RouterOptions::default(),
            routes: Vec::new(),
            filters: Vec::new(),
            not_found: None,
            exceptions: CompositeExceptionHandler::new(),
        }
    }

    pub fn options(mut self, options: RouterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.options.case_insensitive = enabled;
        self
    }

    pub fn debug_routing(mut self, enabled: bool) -> Self {
        self.options.debug_routing = enabled;
        self
    }

    pub fn route(
        mut self,
        method: impl Into<RouteMethod>,
        template: &str,
        handler: impl Handler,
    ) -> Self {
        self.routes
            .push((method.into(), template.to_string(), Arc::new(handler)));
        self
    }

    /// Also answers `HEAD` unless a `HEAD` route with the same template exists.
    pub fn get(self, template: &str, handler: impl Handler) -> Self {
        self.route(Method::GET, template, handler)
    }

    pub fn post(self, template: &str, handler: impl Handler) -> Self {
        self.route(Method::POST, template, handler)
    }

    pub fn put(self, template: &str, handler: impl Handler) -> Self {
        self.route(Method::PUT, template, handler)
    }

    pub fn patch(self, template: &str, handler: impl Handler) -> Self {
        self.route(Method::PATCH, template, handler)
    }

    pub fn delete(self, template: &str, handler: impl Handler) -> Self {
        self.route(Method::DELETE, template, handler)
    }

    pub fn any(self, template: &str, handler: impl Handler) -> Self {
        self.route(RouteMethod::Any, template, handler)
    }

    /// Register a filter; lower `priority` runs first, ties keep
    /// registration order.
    pub fn filter(mut self, template: &str, priority: i32, filter: impl Filter) -> Self {
        self.filters
            .push((template.to_string(), priority, Arc::new(filter)));
        self
    }

    pub fn not_found(mut self, handler: impl Handler) -> Self {
        self.not_found = Some(Arc::new(handler));
        self
    }

    pub fn exception_handler(mut self, handler: impl ExceptionHandler) -> Self {
        self.exceptions = self.exceptions.with(handler);
        self
    }

    pub fn build(self) -> Result<Router, RouterError> {
        let case_insensitive = self.options.case_insensitive;
        let mut errors = Vec::new();

        let mut seen: HashSet<(RouteMethod, String)> = HashSet::new();
        let mut entries = Vec::with_capacity(self.routes.len());
        for (method, template, handler) in self.routes {
            if !seen.insert((method.clone(), template.clone())) {
                errors.push(RouterError::DuplicateRoute {
                    method: method.to_string(),
                    template,
                });
                continue;
            }
            match PathSpec::compile(&template, case_insensitive) {
                Ok(spec) => entries.push(RouteEntry {
                    spec,
                    method,
                    handler,
                }),
                Err(e) => errors.push(e),
            }
        }

        let mirrored: Vec<RouteEntry> = entries
            .iter()
            .filter(|entry| entry.method == RouteMethod::Exact(Method::GET))
            .filter(|entry| {
                !seen.contains(&(
                    RouteMethod::Exact(Method::HEAD),
                    entry.spec.template().to_string(),
                ))
            })
            .map(|entry| RouteEntry {
                spec: entry.spec.clone(),
                method: RouteMethod::Exact(Method::HEAD),
                handler: entry.handler.clone(),
            })
            .collect();
        entries.extend(mirrored);

        let mut filters = Vec::with_capacity(self.filters.len());
        for (template, priority, filter) in self.filters {
            match PathSpec::compile(&template, case_insensitive) {
                Ok(spec) => filters.push(FilterEntry {
                    spec,
                    priority,
                    filter,
                }),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            for e in &errors {
                error!(error = %e, "invalid router configuration");
            }
            return Err(if errors.len() == 1 {
                errors.remove(0)
            } else {
                RouterError::Invalid(errors)
            });
        }

        filters.sort_by_key(|entry| entry.priority);

        let mut routes: HashMap<Method, Vec<RouteEntry>> = HashMap::new();
        let mut any_routes = Vec::new();
        for entry in entries {
            match &entry.method {
                RouteMethod::Exact(method) => {
                    routes.entry(method.clone()).or_default().push(entry)
                }
                RouteMethod::Any => any_routes.push(entry),
            }
        }
        for list in routes.values_mut() {
            list.sort_by(|a, b| a.spec.cmp(&b.spec));
        }
        any_routes.sort_by(|a, b| a.spec.cmp(&b.spec));

        let router = Router {
            inner: Arc::new(RouterInner {
                filters,
                routes,
                any_routes,
                not_found: self.not_found.unwrap_or_else(|| Arc::new(NotFound)),
                exceptions: self.exceptions,
                options: self.options,
            }),
        };
        info!(
            routes = router.route_count(),
            filters = router.filter_count(),
            case_insensitive,
            debug_routing = self.options.debug_routing,
            "router built"
        );
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::core::response_body::ResponseBody;

    fn text(body: &'static str) -> impl Handler {
        move |_req: Request| Reply::response(Response::text(StatusCode::OK, body))
    }

    fn body_of(response: &Response) -> String {
        match response.body() {
            ResponseBody::Bytes(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
            ResponseBody::Empty => String::new(),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    async fn call(router: &Router, method: Method, uri: &str) -> Response {
        router.dispatch(Request::parse(method, uri).unwrap()).await
    }

    #[tokio::test]
    async fn test_specificity_beats_registration_order() {
        let router = Router::builder()
            .get("/users/*", text("wildcard"))
            .get("/users/{id}", text("param"))
            .get("/users/admin", text("literal"))
            .build()
            .unwrap();

        assert_eq!(body_of(&call(&router, Method::GET, "/users/admin").await), "literal");
        assert_eq!(body_of(&call(&router, Method::GET, "/users/42").await), "param");
        assert_eq!(body_of(&call(&router, Method::GET, "/users/a/b").await), "wildcard");
    }

    #[tokio::test]
    async fn test_exact_method_then_any_then_not_found() {
        let router = Router::builder()
            .post("/items", text("post"))
            .any("/items", text("any"))
            .build()
            .unwrap();

        assert_eq!(body_of(&call(&router, Method::POST, "/items").await), "post");
        assert_eq!(body_of(&call(&router, Method::DELETE, "/items").await), "any");
        let missing = call(&router, Method::GET, "/nothing").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_is_mirrored_to_head() {
        let router = Router::builder()
            .get("/page", text("page"))
            .get("/custom", text("get"))
            .route(Method::HEAD, "/custom", text("head"))
            .build()
            .unwrap();

        assert_eq!(call(&router, Method::HEAD, "/page").await.status(), StatusCode::OK);
        assert_eq!(body_of(&call(&router, Method::HEAD, "/custom").await), "head");
    }

    #[test]
    fn test_duplicate_and_invalid_registrations_fail_build() {
        let error = Router::builder()
            .get("/a", text("one"))
            .get("/a", text("two"))
            .get("/b/{", text("bad"))
            .build()
            .unwrap_err();
        match error {
            RouterError::Invalid(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[0], RouterError::DuplicateRoute { .. }));
                assert!(matches!(errors[1], RouterError::InvalidTemplate { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let single = Router::builder()
            .post("/x", text("one"))
            .post("/x", text("two"))
            .build()
            .unwrap_err();
        assert!(matches!(single, RouterError::DuplicateRoute { .. }));
    }

    #[tokio::test]
    async fn test_path_params_reach_handler() {
        let router = Router::builder()
            .get("/orders/{id:[0-9]+}", |req: Request| {
                let id = req.param_as::<u64>("id");
                match id {
                    Ok(id) => Reply::response(Response::text(StatusCode::OK, format!("order {id}"))),
                    Err(e) => Reply::error(e),
                }
            })
            .build()
            .unwrap();
        assert_eq!(body_of(&call(&router, Method::GET, "/orders/17").await), "order 17");
        assert_eq!(
            call(&router, Method::GET, "/orders/x").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_500() {
        let router = Router::builder()
            .get("/boom", |_req: Request| -> Reply { panic!("handler exploded") })
            .build()
            .unwrap();
        let response = call(&router, Method::GET, "/boom").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_of(&response).contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_case_insensitive_option() {
        let router = Router::builder()
            .case_insensitive(true)
            .get("/Docs/{page}", text("docs"))
            .build()
            .unwrap();
        assert_eq!(body_of(&call(&router, Method::GET, "/docs/intro").await), "docs");
    }
}
