/// Live connection registry.
///
/// Every accepted connection is tracked from accept to close, so tunnel
/// outcomes can be logged with their byte totals and so shutdown can wait
/// for the proxy to go quiet before the drain deadline forces the rest down.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Per-connection bookkeeping, returned to the caller when the connection is
/// deregistered.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub peer: String,
    /// CONNECT target or forwarded host, once the request line is parsed.
    pub target: String,
    pub opened_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Lifetime counters across all connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub opened: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Default)]
struct Inner {
    active: HashMap<String, ConnectionEntry>,
    totals: Totals,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    /// Number of active connections, published so the drain can await zero.
    active_count: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        let (active_count, _) = watch::channel(0);
        Arc::new(ConnectionRegistry {
            inner: Mutex::new(Inner::default()),
            active_count,
        })
    }

    // A poisoned lock still guards consistent counters; keep going.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a connection from the moment it is accepted.
    pub fn register(&self, id: &str, peer: &str) {
        let mut inner = self.lock();
        inner.totals.opened += 1;
        inner.active.insert(
            id.to_string(),
            ConnectionEntry {
                peer: peer.to_string(),
                target: String::new(),
                opened_at: Utc::now(),
                bytes_in: 0,
                bytes_out: 0,
            },
        );
        self.active_count.send_replace(inner.active.len());
    }

    /// Stop tracking a closed connection; its final entry is handed back so
    /// the caller can log it.
    pub fn deregister(&self, id: &str) -> Option<ConnectionEntry> {
        let mut inner = self.lock();
        let entry = inner.active.remove(id);
        self.active_count.send_replace(inner.active.len());
        entry
    }

    /// Attach the parsed target to a tracked connection.
    pub fn record_target(&self, id: &str, target: &str) {
        if let Some(entry) = self.lock().active.get_mut(id) {
            entry.target = target.to_string();
        }
    }

    /// Account bytes moved through a connection, in both directions at once.
    pub fn record_transfer(&self, id: &str, bytes_in: u64, bytes_out: u64) {
        let mut inner = self.lock();
        inner.totals.bytes_in += bytes_in;
        inner.totals.bytes_out += bytes_out;
        if let Some(entry) = inner.active.get_mut(id) {
            entry.bytes_in += bytes_in;
            entry.bytes_out += bytes_out;
        }
    }

    pub fn active(&self) -> usize {
        self.lock().active.len()
    }

    pub fn totals(&self) -> Totals {
        self.lock().totals
    }

    /// Resolve once no tracked connections remain. The shutdown drain awaits
    /// this, bounded by its own deadline.
    pub async fn wait_idle(&self) {
        let mut count = self.active_count.subscribe();
        loop {
            if *count.borrow_and_update() == 0 {
                return;
            }
            if count.changed().await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::new();
        registry.register("c1", "127.0.0.1:40001");
        registry.register("c2", "127.0.0.1:40002");
        assert_eq!(registry.active(), 2);
        assert_eq!(registry.totals().opened, 2);

        let entry = registry.deregister("c1").unwrap();
        assert_eq!(entry.peer, "127.0.0.1:40001");
        assert_eq!(registry.active(), 1);
        // Lifetime counters survive the connection.
        assert_eq!(registry.totals().opened, 2);
        assert!(registry.deregister("c1").is_none());
    }

    #[test]
    fn test_transfer_accounting() {
        let registry = ConnectionRegistry::new();
        registry.register("c1", "peer");
        registry.record_target("c1", "example.com:443");
        registry.record_transfer("c1", 100, 200);
        registry.record_transfer("c1", 1, 2);

        let entry = registry.deregister("c1").unwrap();
        assert_eq!(entry.target, "example.com:443");
        assert_eq!(entry.bytes_in, 101);
        assert_eq!(entry.bytes_out, 202);
        assert_eq!(registry.totals().bytes_in, 101);
        assert_eq!(registry.totals().bytes_out, 202);

        // Transfers on unknown connections still count toward the totals.
        registry.record_transfer("gone", 5, 5);
        assert_eq!(registry.totals().bytes_in, 106);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_when_last_connection_closes() {
        let registry = ConnectionRegistry::new();
        registry.register("c1", "peer");

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_idle().await })
        };

        // Still busy: the waiter must not resolve yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.deregister("c1");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle must resolve once the registry is empty")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_registry_is_immediate() {
        let registry = ConnectionRegistry::new();
        tokio::time::timeout(Duration::from_millis(100), registry.wait_idle())
            .await
            .expect("an empty registry is already idle");
    }
}
