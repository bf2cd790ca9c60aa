use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tracing::info;

use crate::http::connection::Connection;
use crate::http::dispatcher::{CycleOutcome, Dispatcher};
use crate::http::parser::ParseLimits;
use crate::http::response::Response;
use crate::http::writer::{Exchange, ResponseWriter};
use crate::server::pool::WorkerPool;
use crate::server::sock::{Sock, SockSet};
use crate::ws::session::WsSession;

/// Pause after a failed accept, so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What every connection driver shares.
#[derive(Clone)]
pub struct ConnectionContext {
    pub dispatcher: Arc<Dispatcher>,
    /// `None` runs cycles on the connection task itself
    pub pool: Option<WorkerPool>,
    pub limits: ParseLimits,
    pub read_timeout: Duration,
    pub max_message_size: usize,
    pub shutdown: watch::Receiver<bool>,
}

/// A listening endpoint and the live connections it accepted.
pub struct Connector {
    listener: TcpListener,
    local_addr: SocketAddr,
    socks: SockSet,
}

impl Connector {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            socks: SockSet::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live view of this connector's connections.
    pub fn socks(&self) -> &SockSet {
        &self.socks
    }

    /// Waits for a connection and registers an Open Sock for it.
    pub async fn accept(&self) -> io::Result<(TcpStream, Arc<Sock>)> {
        let (stream, peer) = self.listener.accept().await?;
        let sock = self.socks.register(peer);
        Ok((stream, sock))
    }

    /// Accept loop. Returns, dropping the listener, once shutdown is
    /// signalled.
    pub async fn run(self, ctx: ConnectionContext) {
        let mut shutdown = ctx.shutdown.clone();

        loop {
            tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok((stream, sock)) => {
                        let peer = sock.peer();
                        info!("Accepted connection from {}", peer);

                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, sock, ctx).await {
                                tracing::error!("Connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(addr = %self.local_addr, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }

        info!(addr = %self.local_addr, "Stopped accepting connections");
    }
}

/// Drives one connection until it closes: waits for request bytes, claims
/// the Sock and runs one cycle at a time.
pub async fn serve_connection<S>(stream: S, sock: Arc<Sock>, ctx: ConnectionContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut conn = Connection::new(stream, ctx.limits, ctx.read_timeout);
    let mut shutdown = ctx.shutdown.clone();

    loop {
        if !conn.has_buffered() {
            let read = tokio::select! {
                read = conn.fill_buf() => read,
                _ = sock.closed() => break,
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(sock = %sock.id(), error = %e, "Read failed while idle");
                    break;
                }
            }
        }

        // Lost to the reaper between the read and the claim
        if !sock.begin_cycle() {
            break;
        }

        let outcome = match &ctx.pool {
            None => ctx.dispatcher.run_cycle(&mut conn, &sock).await,
            Some(pool) => match run_on_pool(pool, &ctx.dispatcher, conn, &sock).await {
                Ok((returned, outcome)) => {
                    conn = returned;
                    outcome
                }
                Err(Some(mut rejected)) => {
                    tracing::warn!(sock = %sock.id(), peer = %sock.peer(), "Worker pool saturated, answering 503");
                    let mut writer = ResponseWriter::for_exchange(Response::service_unavailable(), Exchange::CLOSING);
                    if let Err(e) = rejected.write_response(&mut writer).await {
                        tracing::debug!(sock = %sock.id(), error = %e, "Failed to write 503");
                    }
                    sock.close();
                    return Ok(());
                }
                Err(None) => {
                    tracing::warn!(sock = %sock.id(), "Request cycle ended without a result");
                    sock.close();
                    return Ok(());
                }
            },
        };

        match outcome {
            CycleOutcome::KeepAlive => {
                if !sock.end_cycle() || *shutdown.borrow() {
                    break;
                }
            }
            CycleOutcome::Close => break,
            CycleOutcome::Upgrade(handler) => {
                // Closed while the 101 was going out
                if !sock.end_cycle() {
                    break;
                }
                let (stream, buffered) = conn.into_parts();
                WsSession::new(&sock, handler, ctx.max_message_size, ctx.read_timeout)
                    .run(stream, buffered)
                    .await;
                sock.close();
                return Ok(());
            }
        }
    }

    sock.close();
    Ok(())
}

/// Runs one cycle on a pool worker and hands the connection back.
///
/// `Err(Some(conn))` means the pool rejected the cycle before it started;
/// `Err(None)` means the cycle was lost (worker panic or pool shutdown).
async fn run_on_pool<S>(
    pool: &WorkerPool,
    dispatcher: &Arc<Dispatcher>,
    conn: Connection<S>,
    sock: &Arc<Sock>,
) -> Result<(Connection<S>, CycleOutcome), Option<Connection<S>>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let slot = Arc::new(Mutex::new(Some(conn)));
    let (tx, rx) = oneshot::channel();

    let task_slot = Arc::clone(&slot);
    let dispatcher = Arc::clone(dispatcher);
    let sock = Arc::clone(sock);
    let task = async move {
        let taken = task_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut conn) = taken else {
            return;
        };
        let outcome = dispatcher.run_cycle(&mut conn, &sock).await;
        let _ = tx.send((conn, outcome));
    };

    match pool.spawn(task) {
        Ok(()) => rx.await.map_err(|_| None),
        Err(rejected) => {
            // Dropping the task releases its handle on the slot
            drop(rejected);
            Err(slot.lock().unwrap_or_else(PoisonError::into_inner).take())
        }
    }
}
