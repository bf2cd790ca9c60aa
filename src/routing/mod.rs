//! URL pattern matching, handlers and interceptor chains.

pub mod handler;
pub mod pattern;
pub mod router;

pub use handler::{handler_fn, Endpoint, Handler, Interceptor, Next};
pub use pattern::UrlPattern;
pub use router::{Resolved, RouteError, Router, RouterBuilder};
