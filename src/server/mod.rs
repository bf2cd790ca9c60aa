//! Server lifecycle and endpoint registration.
//!
//! ```text
//!  Configured ──init──▶ Initialized ──start──▶ Running ──stop──▶ Stopped
//!                            │                                      │
//!                            └──────────────destroy─────────────────┴──▶ Destroyed
//! ```
//!
//! Handlers, interceptors and WebSocket endpoints are registered while
//! Configured; `init` freezes them into the router.

pub mod listener;
pub mod pool;
pub mod reaper;
pub mod sock;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ServerError;
use crate::http::dispatcher::Dispatcher;
use crate::http::parser::ParseLimits;
use crate::routing::handler::{Handler, Interceptor};
use crate::routing::router::RouterBuilder;
use crate::ws::session::WsHandler;
use listener::{ConnectionContext, Connector};
use pool::{PoolConfig, PoolStats, WorkerPool};
use reaper::IdleReaper;
use sock::SockSet;

/// How often `stop` checks whether in-flight cycles have finished.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configured,
    Initialized,
    Running,
    Stopped,
    Destroyed,
}

pub struct Server {
    config: Config,
    phase: Phase,
    routes: RouterBuilder,
    connectors: Vec<Connector>,
    socks: Vec<SockSet>,
    local_addrs: Vec<SocketAddr>,
    dispatcher: Option<Arc<Dispatcher>>,
    pool: Option<WorkerPool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let mut routes = RouterBuilder::new();
        routes.context_path(config.server.context_path.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            phase: Phase::Configured,
            routes,
            connectors: Vec::new(),
            socks: Vec::new(),
            local_addrs: Vec::new(),
            dispatcher: None,
            pool: None,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn register_handler<H>(&mut self, patterns: &[&str], handler: H) -> Result<&mut Self, ServerError>
    where
        H: Handler + 'static,
    {
        self.expect_phase("register a handler on", Phase::Configured)?;
        self.routes.handler(patterns, Arc::new(handler))?;
        Ok(self)
    }

    pub fn register_interceptor<I>(&mut self, interceptor: I, patterns: &[&str]) -> Result<&mut Self, ServerError>
    where
        I: Interceptor + 'static,
    {
        self.expect_phase("register an interceptor on", Phase::Configured)?;
        self.routes.interceptor(Arc::new(interceptor), patterns)?;
        Ok(self)
    }

    pub fn register_websocket<W>(&mut self, patterns: &[&str], handler: W) -> Result<&mut Self, ServerError>
    where
        W: WsHandler + 'static,
    {
        self.expect_phase("register a WebSocket endpoint on", Phase::Configured)?;
        self.routes.websocket(patterns, Arc::new(handler))?;
        Ok(self)
    }

    /// Binds the listener, freezes the routes and sizes the worker pool.
    pub async fn init(&mut self) -> Result<(), ServerError> {
        self.expect_phase("initialize", Phase::Configured)?;
        self.config.validate()?;

        let addr = self.config.server.listen_addr.clone();
        let bound = Connector::bind(addr.as_str()).await;
        let connector = bound.map_err(|source| ServerError::Bind { addr, source })?;

        let router = std::mem::take(&mut self.routes).build();
        tracing::info!(
            handlers = router.handler_count(),
            interceptors = router.interceptor_count(),
            context_path = router.context_path(),
            "Routes frozen"
        );

        if self.config.thread_pool.enabled {
            self.pool = Some(WorkerPool::new(PoolConfig::from(&self.config.thread_pool)));
        }

        self.socks.push(connector.socks().clone());
        self.local_addrs.push(connector.local_addr());
        self.connectors.push(connector);
        self.dispatcher = Some(Arc::new(Dispatcher::new(Arc::new(router))));
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Starts the accept loops and the idle reaper.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.expect_phase("start", Phase::Initialized)?;

        let Some(dispatcher) = self.dispatcher.clone() else {
            return Err(self.lifecycle_error("start"));
        };
        let server = &self.config.server;
        let ctx = ConnectionContext {
            dispatcher,
            pool: self.pool.clone(),
            limits: ParseLimits {
                max_header_size: server.max_header_size,
                max_body_size: server.max_body_size,
            },
            read_timeout: server.read_timeout(),
            max_message_size: self.config.websocket.max_message_size,
            shutdown: self.shutdown.subscribe(),
        };

        for connector in self.connectors.drain(..) {
            let ctx = ctx.clone();
            self.tasks.push(tokio::spawn(connector.run(ctx)));
        }

        let reaper = IdleReaper::new(self.socks.clone(), server.keep_alive(), server.reap_interval());
        self.tasks.push(tokio::spawn(reaper.run(self.shutdown.subscribe())));

        tracing::info!(addrs = ?self.local_addrs, "Server started");
        self.phase = Phase::Running;
        Ok(())
    }

    /// Stops accepting, closes idle connections and waits (up to
    /// `shutdown_timeout`) for in-flight cycles before draining the pool.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        self.expect_phase("stop", Phase::Running)?;
        tracing::info!("Server stopping");

        self.shutdown.send_replace(true);
        let deadline = Instant::now() + self.config.server.shutdown_timeout();

        let closed: usize = self.socks.iter().map(SockSet::close_waiting).sum();
        tracing::debug!(closed, "Closed idle connections");

        while self.connection_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let remaining = self.connection_count();
        if remaining > 0 {
            tracing::warn!(remaining, "Connections still busy at shutdown deadline");
        }

        if let Some(pool) = &self.pool {
            pool.shutdown();
            let left = deadline.saturating_duration_since(Instant::now());
            if !pool.drain(left).await {
                tracing::warn!("Worker pool did not drain before the deadline");
            }
        }

        self.phase = Phase::Stopped;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Force-closes every connection and aborts background tasks.
    pub fn destroy(&mut self) -> Result<(), ServerError> {
        if matches!(self.phase, Phase::Configured | Phase::Destroyed) {
            return Err(self.lifecycle_error("destroy"));
        }

        self.shutdown.send_replace(true);
        let closed: usize = self.socks.iter().map(SockSet::close_all).sum();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.connectors.clear();

        tracing::info!(closed, "Server destroyed");
        self.phase = Phase::Destroyed;
        Ok(())
    }

    /// Addresses the server is bound to, once initialized.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Live connection collections, one per listener.
    pub fn socks(&self) -> &[SockSet] {
        &self.socks
    }

    pub fn connection_count(&self) -> usize {
        self.socks.iter().map(SockSet::len).sum()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(WorkerPool::stats)
    }

    fn expect_phase(&self, action: &'static str, expected: Phase) -> Result<(), ServerError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(self.lifecycle_error(action))
        }
    }

    fn lifecycle_error(&self, action: &'static str) -> ServerError {
        ServerError::Lifecycle {
            action,
            phase: self.phase,
        }
    }
}
