//! Client connection identity and accounting.
//!
//! Every accepted socket gets a [`ConnectionGuard`]: a sequential id for its
//! tracing span and a slot in the live-connection count, which feeds the
//! `proxy_active_connections` gauge and the shutdown drain.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Span;

use crate::observability::metrics;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Sequential client connection id, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live client connections, tunnels included.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a newly accepted connection until the guard drops.
    pub fn open(&self, peer: SocketAddr) -> ConnectionGuard {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(live);
        ConnectionGuard {
            live: Arc::clone(&self.live),
            id: ConnectionId::next(),
            peer,
            opened: Instant::now(),
        }
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait for every connection to close, at most `grace`.
    ///
    /// Returns how many were still open.
    pub async fn drain(&self, grace: Duration) -> u64 {
        let _ = tokio::time::timeout(grace, async {
            while self.live() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        self.live()
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<AtomicU64>,
    id: ConnectionId,
    peer: SocketAddr,
    opened: Instant,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Span every event on this connection is recorded under.
    pub fn span(&self) -> Span {
        tracing::info_span!("conn", id = %self.id, peer = %self.peer)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let live = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_active_connections(live);
        tracing::trace!(
            connection = %self.id,
            peer = %self.peer,
            elapsed_ms = self.opened.elapsed().as_millis() as u64,
            "client connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn ids_are_sequential_and_distinct() {
        let tracker = ConnectionTracker::new();
        let a = tracker.open(peer());
        let b = tracker.open(peer());
        assert_ne!(a.id(), b.id());
        assert!(b.id().0 > a.id().0);
        assert!(a.id().to_string().starts_with("conn-"));
    }

    #[test]
    fn guards_keep_the_count() {
        let tracker = ConnectionTracker::new();
        let first = tracker.open(peer());
        let second = tracker.clone().open(peer());
        assert_eq!(tracker.live(), 2);

        drop(first);
        assert_eq!(tracker.live(), 1);
        drop(second);
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn drain_returns_once_connections_close() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.open(peer());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert_eq!(tracker.drain(Duration::from_secs(2)).await, 0);
    }

    #[tokio::test]
    async fn drain_stops_waiting_after_grace() {
        let tracker = ConnectionTracker::new();
        let _stuck = tracker.open(peer());
        assert_eq!(tracker.drain(Duration::from_millis(150)).await, 1);
    }
}
