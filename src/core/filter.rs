//! Request filters and the chain that runs them.
use std::sync::Arc;

use super::{reply::Reply, request::Request, router::RouterInner};

/// Runs before route selection for requests whose path matches.
///
/// A filter either forwards with `chain.next(request)` (possibly after
/// modifying attributes such as the path override) or answers itself, in
/// which case nothing after it runs.
pub trait Filter: Send + Sync + 'static {
    fn filter(&self, request: Request, chain: FilterChain) -> Reply;
}

impl<F> Filter for F
where
    F: Fn(Request, FilterChain) -> Reply + Send + Sync + 'static,
{
    fn filter(&self, request: Request, chain: FilterChain) -> Reply {
        self(request, chain)
    }
}

/// Position in the router's filter list.
pub struct FilterChain {
    router: Arc<RouterInner>,
    position: usize,
}

impl FilterChain {
    pub(crate) fn start(router: Arc<RouterInner>) -> Self {
        Self {
            router,
            position: 0,
        }
    }

    /// Run the next matching filter, or route the request once none remain.
    ///
    /// Matching uses the request's routing path at the time of the call.
    pub fn next(self, request: Request) -> Reply {
        let path = match request.routing_path() {
            Ok(path) => path,
            Err(e) => return Reply::error(e),
        };
        let router = self.router;
        for (index, entry) in router.filters().iter().enumerate().skip(self.position) {
            let matched = entry.spec.matches(&path);
            request.trace().record(|| {
                format!(
                    "filter {} (priority {}) {} {path}",
                    entry.spec,
                    entry.priority,
                    if matched { "matched" } else { "skipped" }
                )
            });
            if matched {
                let filter = entry.filter.clone();
                let chain = FilterChain {
                    router: router.clone(),
                    position: index + 1,
                };
                return super::router::guarded(|| filter.filter(request, chain));
            }
        }
        router.route(request)
    }
}
