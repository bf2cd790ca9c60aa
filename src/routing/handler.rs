//! Request handlers and the interceptor chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::ws::session::WsHandler;

/// Terminal request handler.
///
/// Errors are logged by the dispatcher and answered with a 500.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<Response>;
}

/// Chain participant that runs before the handler.
///
/// Call `next.run(request)` to continue down the chain, or return a response
/// directly to short-circuit it.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, request: &mut Request, next: Next<'_>) -> anyhow::Result<Response>;
}

/// The remainder of an interceptor chain.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn new(interceptors: &'a [Arc<dyn Interceptor>], handler: &'a dyn Handler) -> Self {
        Self {
            interceptors,
            handler,
        }
    }

    pub async fn run(self, request: &mut Request) -> anyhow::Result<Response> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                first
                    .intercept(request, Next::new(rest, self.handler))
                    .await
            }
            None => self.handler.handle(request).await,
        }
    }
}

/// What a handler mapping points at.
#[derive(Clone)]
pub enum Endpoint {
    Http(Arc<dyn Handler>),
    WebSocket(Arc<dyn WsHandler>),
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Http(_) => f.write_str("Endpoint::Http"),
            Endpoint::WebSocket(_) => f.write_str("Endpoint::WebSocket"),
        }
    }
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F>(F);

/// Wraps a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Request) -> anyhow::Result<Response> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Request) -> anyhow::Result<Response> + Send + Sync,
{
    async fn handle(&self, request: &mut Request) -> anyhow::Result<Response> {
        (self.0)(request)
    }
}
