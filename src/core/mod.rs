pub mod attributes;
pub mod body;
pub mod codec;
pub mod error;
pub mod exception;
pub mod filter;
pub mod handler;
pub mod path_spec;
pub mod reply;
pub mod request;
pub mod response;
pub mod response_body;
pub mod router;
pub mod trace;

pub use attributes::{AttributeError, Attributes, PATH_OVERRIDE};
pub use body::{CompositeBuffer, PendingRead, StreamingBody};
pub use codec::BodyCodecs;
pub use error::{HttpError, RouterError};
pub use exception::{CompositeExceptionHandler, ExceptionHandler, status_for};
pub use filter::{Filter, FilterChain};
pub use handler::{AsyncHandler, Handler, NotFound, async_handler};
pub use path_spec::PathSpec;
pub use reply::Reply;
pub use request::Request;
pub use response::Response;
pub use response_body::ResponseBody;
pub use router::{RouteMethod, Router, RouterBuilder, RouterOptions};
pub use trace::{RouteTrace, TRACE_HEADER};
