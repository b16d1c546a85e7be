//! streamgate - a backpressure-aware stream engine with an HTTP routing pipeline.
//!
//! The crate has two layers. The **reactive** layer is a small publish/subscribe
//! contract (publisher, subscriber, subscription with demand) plus a library of
//! stages assembled with [`reactive::Flo`]: mapping, filtering, collecting,
//! partitioning and a parallel stage that hands items to a worker pool. The
//! **core** layer routes HTTP requests through priority ordered filters to
//! handlers selected by path templates (`{name}`, `{name:regex}`, `*`), with
//! request bodies that stream in chunk by chunk under a size cap and response
//! bodies that stream out with backpressure.
//!
//! # Quick Example
//! ```no_run
//! use http::StatusCode;
//! use streamgate::{
//!     adapters::HttpBridge,
//!     core::{Reply, Request, Response, Router},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let router = Router::builder()
//!     .get("/hello/{name}", |req: Request| {
//!         let name = req.param("name").unwrap_or("world").to_string();
//!         Reply::response(Response::text(StatusCode::OK, format!("hello {name}")))
//!     })
//!     .build()?;
//!
//! let app = HttpBridge::new(router, 1024 * 1024).into_axum_router();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits for executors, configuration lookup, body codecs and
//! response channels) from **adapters** (tokio worker pools, the `config` crate, JSON/text
//! codecs, the axum bridge). `reactive` and `core` depend only on ports.
//!
//! # Error Handling
//! Pipeline failures travel as [`reactive::FlowError`], which keeps the typed cause reachable
//! through `std::error::Error::source`. Protocol failures are [`core::HttpError`] values
//! carrying a status code; startup problems (router registration, configuration) are reported
//! all at once rather than one at a time. Application plumbing uses `eyre::Result`.
//!
//! # Concurrency & Data Structures
//! Signal paths use `parking_lot` locks and atomics and never await. The executor registry
//! uses `scc::HashMap`.
// Re-export public modules with explicit visibility controls
pub mod config;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;
pub mod reactive;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ExecutorRegistry, HttpBridge, PropertySource, Scheduler},
    config::{ServerConfig, ServerConfigValidator},
    core::{Reply, Request, Response, Router},
    reactive::{Flo, FlowError},
};
