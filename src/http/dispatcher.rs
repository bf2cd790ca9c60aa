//! Request cycle: read one request, route it, run the chain, write the reply.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::connection::Connection;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::http::writer::{Exchange, ResponseWriter};
use crate::routing::handler::{Endpoint, Next};
use crate::routing::router::{Resolved, Router};
use crate::server::sock::Sock;
use crate::ws::handshake::{handshake_response, is_upgrade_request};
use crate::ws::session::WsHandler;

/// How a cycle left the connection.
pub enum CycleOutcome {
    /// Wait for the next request on the same connection
    KeepAlive,
    Close,
    /// The 101 was sent; the connection now belongs to a WebSocket session
    Upgrade(Arc<dyn WsHandler>),
}

impl std::fmt::Debug for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::KeepAlive => f.write_str("KeepAlive"),
            CycleOutcome::Close => f.write_str("Close"),
            CycleOutcome::Upgrade(_) => f.write_str("Upgrade"),
        }
    }
}

enum CycleState {
    Receiving,
    Matching(Request),
    Executing(Request, Resolved),
    Responding(Response, Exchange),
    Upgrading(Response, Arc<dyn WsHandler>),
    Done(CycleOutcome),
}

/// Runs request cycles against a frozen [`Router`]. Shared by all
/// connections.
pub struct Dispatcher {
    router: Arc<Router>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Runs one cycle on `conn`. The caller must hold the Sock in
    /// Processing; closing the Sock mid-cycle ends it with `Close`.
    pub async fn run_cycle<S>(&self, conn: &mut Connection<S>, sock: &Sock) -> CycleOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            outcome = self.drive(conn, sock) => outcome,
            _ = sock.closed() => {
                tracing::debug!(sock = %sock.id(), "Connection closed mid-cycle");
                CycleOutcome::Close
            }
        }
    }

    async fn drive<S>(&self, conn: &mut Connection<S>, sock: &Sock) -> CycleOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let mut served: Option<(Method, String)> = None;
        let mut status: Option<StatusCode> = None;
        let mut state = CycleState::Receiving;

        loop {
            state = match state {
                CycleState::Receiving => match conn.read_request().await {
                    Ok(Some(request)) => CycleState::Matching(request),
                    Ok(None) => CycleState::Done(CycleOutcome::Close),
                    Err(e) => {
                        tracing::warn!(sock = %sock.id(), peer = %sock.peer(), error = %e, "Failed to read request");
                        match e.response() {
                            Some(response) => CycleState::Responding(response, Exchange::CLOSING),
                            None => CycleState::Done(CycleOutcome::Close),
                        }
                    }
                },

                CycleState::Matching(request) => {
                    served = Some((request.method, request.path.clone()));
                    self.route(request)
                }

                CycleState::Executing(mut request, resolved) => {
                    let exchange = Exchange::for_request(&request);
                    let response = self.execute(&mut request, &resolved).await;
                    CycleState::Responding(response, exchange)
                }

                CycleState::Responding(response, mut exchange) => {
                    if response.headers.has_token("Connection", "close") {
                        exchange.keep_alive = false;
                    }
                    status = Some(response.status);

                    let mut writer = ResponseWriter::for_exchange(response, exchange);
                    match conn.write_response(&mut writer).await {
                        Ok(_) if writer.keeps_alive() => CycleState::Done(CycleOutcome::KeepAlive),
                        Ok(_) => CycleState::Done(CycleOutcome::Close),
                        Err(e) => {
                            tracing::debug!(sock = %sock.id(), error = %e, "Failed to write response");
                            CycleState::Done(CycleOutcome::Close)
                        }
                    }
                }

                CycleState::Upgrading(response, handler) => {
                    status = Some(response.status);

                    let mut writer = ResponseWriter::for_exchange(response, Exchange::OPEN);
                    match conn.write_response(&mut writer).await {
                        Ok(_) => CycleState::Done(CycleOutcome::Upgrade(handler)),
                        Err(e) => {
                            tracing::debug!(sock = %sock.id(), error = %e, "Failed to write upgrade response");
                            CycleState::Done(CycleOutcome::Close)
                        }
                    }
                }

                CycleState::Done(outcome) => {
                    if let Some((method, path)) = served {
                        tracing::info!(
                            sock = %sock.id(),
                            method = %method,
                            path = %path,
                            status = status.map(|s| s.as_u16()),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            outcome = ?outcome,
                            "Request completed"
                        );
                    }
                    return outcome;
                }
            };
        }
    }

    fn route(&self, request: Request) -> CycleState {
        let exchange = Exchange::for_request(&request);

        let Some(resolved) = self.router.resolve(&request.path) else {
            return CycleState::Responding(Response::not_found(), exchange);
        };

        let handler = match &resolved.endpoint {
            Endpoint::Http(_) => return CycleState::Executing(request, resolved),
            Endpoint::WebSocket(handler) => Arc::clone(handler),
        };

        if !is_upgrade_request(&request) {
            return CycleState::Responding(upgrade_required(), exchange);
        }

        match handshake_response(&request) {
            Ok(response) => CycleState::Upgrading(response, handler),
            Err(e) => {
                tracing::warn!(path = %request.path, error = %e, "WebSocket handshake rejected");
                CycleState::Responding(e.response(), Exchange::CLOSING)
            }
        }
    }

    /// Runs the interceptor chain and handler. Errors and panics become 500.
    pub async fn execute(&self, request: &mut Request, resolved: &Resolved) -> Response {
        let Endpoint::Http(handler) = &resolved.endpoint else {
            return Response::internal_error();
        };

        let chain = Next::new(&resolved.interceptors, handler.as_ref());
        match AssertUnwindSafe(chain.run(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(
                    method = %request.method,
                    path = %request.path,
                    pattern = %resolved.pattern,
                    error = %e,
                    "Handler failed"
                );
                Response::internal_error()
            }
            Err(_) => {
                tracing::error!(
                    method = %request.method,
                    path = %request.path,
                    pattern = %resolved.pattern,
                    "Handler panicked"
                );
                Response::internal_error()
            }
        }
    }
}

fn upgrade_required() -> Response {
    ResponseBuilder::new(StatusCode::UpgradeRequired)
        .header("Upgrade", "websocket")
        .header("Content-Type", "text/plain")
        .body("426 Upgrade Required")
        .build()
}
