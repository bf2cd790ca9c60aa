//! Idle connection reaping.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::server::sock::{SockSet, SockState};

/// Periodically closes connections that have waited longer than the
/// keep-alive time for their next request.
pub struct IdleReaper {
    sets: Vec<SockSet>,
    keep_alive: Duration,
    period: Duration,
}

impl IdleReaper {
    pub fn new(sets: Vec<SockSet>, keep_alive: Duration, period: Duration) -> Self {
        Self {
            sets,
            keep_alive,
            period,
        }
    }

    /// One sweep as of `now`. Returns how many Socks were closed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut reaped = 0;

        for set in &self.sets {
            for sock in set.snapshot() {
                let idle = sock.idle_for(now);
                if idle <= self.keep_alive {
                    continue;
                }

                if sock.try_reap(now, self.keep_alive) {
                    tracing::debug!(
                        sock = %sock.id(),
                        peer = %sock.peer(),
                        idle_ms = idle.as_millis() as u64,
                        "Reaped idle connection"
                    );
                    reaped += 1;
                } else if sock.state() != SockState::Processing {
                    tracing::debug!(
                        sock = %sock.id(),
                        state = ?sock.state(),
                        "Connection changed state during sweep, skipped"
                    );
                }
            }
        }

        reaped
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            keep_alive_secs = self.keep_alive.as_secs(),
            period_ms = self.period.as_millis() as u64,
            "Idle reaper starting"
        );

        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.sweep();
                    if reaped > 0 {
                        tracing::info!(reaped, "Closed idle connections");
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("Idle reaper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
