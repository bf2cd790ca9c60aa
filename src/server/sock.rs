//! Connection bookkeeping shared by the connector, the dispatcher and the
//! idle reaper.
//!
//! A [`Sock`] tracks lifecycle state and activity for one accepted
//! connection. The byte stream itself lives in the task driving the
//! connection; closing a Sock signals that task, which drops the stream.
//!
//! State transitions are compare-and-swap operations so that the reaper
//! (`Idle → Closed`) and a new request cycle (`Idle → Processing`) can never
//! both win for the same Sock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;

type Registry = DashMap<SockId, Arc<Sock>>;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SockId(u64);

impl SockId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SockState {
    /// Accepted, no request seen yet
    Open = 0,
    /// A request cycle (or WebSocket delivery) is in progress
    Processing = 1,
    /// Waiting for the next request or frame
    Idle = 2,
    /// Released; never reused
    Closed = 3,
}

impl SockState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SockState::Open,
            1 => SockState::Processing,
            2 => SockState::Idle,
            _ => SockState::Closed,
        }
    }

    fn is_waiting(&self) -> bool {
        matches!(self, SockState::Open | SockState::Idle)
    }
}

/// One accepted connection.
#[derive(Debug)]
pub struct Sock {
    id: SockId,
    peer: SocketAddr,
    state: AtomicU8,
    last_process: Mutex<Instant>,
    closed: watch::Sender<bool>,
    registry: Weak<Registry>,
}

impl Sock {
    pub fn id(&self) -> SockId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SockState {
        SockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SockState::Closed
    }

    pub fn last_process(&self) -> Instant {
        *self.lock_last()
    }

    /// Time since the last completed exchange, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_process())
    }

    /// Records activity. The timestamp never moves backwards.
    pub fn touch(&self) {
        let mut last = self.lock_last();
        let now = Instant::now();
        if now > *last {
            *last = now;
        }
    }

    /// Claims the Sock for a request cycle: `Open | Idle → Processing`.
    ///
    /// Fails once the Sock is closed, or while another cycle holds it.
    pub fn begin_cycle(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !SockState::from_u8(current).is_waiting() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SockState::Processing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases the Sock after a cycle: `Processing → Idle`, refreshing the
    /// activity timestamp. Returns false if the Sock was closed meanwhile.
    pub fn end_cycle(&self) -> bool {
        let mut last = self.lock_last();
        let now = Instant::now();
        if now > *last {
            *last = now;
        }
        self.state
            .compare_exchange(
                SockState::Processing as u8,
                SockState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Closes the Sock if it has been waiting longer than `threshold` at
    /// `now`. Processing Socks are never touched.
    pub fn try_reap(&self, now: Instant, threshold: Duration) -> bool {
        // Holding the timestamp lock keeps a cycle from completing between
        // the age check and the state swap.
        let last = self.lock_last();
        if now.saturating_duration_since(*last) <= threshold {
            return false;
        }
        let reaped = self.close_if_waiting();
        drop(last);
        reaped
    }

    /// Closes the Sock only if no cycle is running on it.
    pub fn close_if_waiting(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !SockState::from_u8(current).is_waiting() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SockState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.finish_close();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Closes the Sock from any state. Idempotent; returns true for the call
    /// that actually closed it.
    ///
    /// A cycle in progress observes the close through [`Sock::closed`] and
    /// ends with a connection-closed outcome.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(SockState::Closed as u8, Ordering::AcqRel);
        if SockState::from_u8(previous) == SockState::Closed {
            return false;
        }
        self.finish_close();
        true
    }

    /// Resolves once the Sock is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only errors after drop
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn finish_close(&self) {
        self.closed.send_replace(true);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        tracing::debug!(sock = %self.id, peer = %self.peer, "Connection closed");
    }

    fn lock_last(&self) -> MutexGuard<'_, Instant> {
        self.last_process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connector's live connections.
///
/// Safe for concurrent insertion (accept loop) and removal (dispatcher,
/// reaper). Closed Socks are removed synchronously with their closure.
#[derive(Debug, Clone, Default)]
pub struct SockSet {
    inner: Arc<Registry>,
}

impl SockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Open Sock for a fresh connection and adds it to the set.
    pub fn register(&self, peer: SocketAddr) -> Arc<Sock> {
        let (closed, _) = watch::channel(false);
        let sock = Arc::new(Sock {
            id: SockId::next(),
            peer,
            state: AtomicU8::new(SockState::Open as u8),
            last_process: Mutex::new(Instant::now()),
            closed,
            registry: Arc::downgrade(&self.inner),
        });
        self.inner.insert(sock.id, Arc::clone(&sock));
        sock
    }

    pub fn get(&self, id: SockId) -> Option<Arc<Sock>> {
        self.inner.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: SockId) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Point-in-time copy of the live Socks.
    ///
    /// Closing a Sock removes it from the map, so callers iterate the copy
    /// rather than holding map guards while closing.
    pub fn snapshot(&self) -> Vec<Arc<Sock>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Closes every Sock that is not mid-cycle. Returns how many were closed.
    pub fn close_waiting(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|sock| sock.close_if_waiting())
            .count()
    }

    /// Closes every Sock regardless of state.
    pub fn close_all(&self) -> usize {
        self.snapshot().iter().filter(|sock| sock.close()).count()
    }
}
