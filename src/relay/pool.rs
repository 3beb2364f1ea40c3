//! Per-client association pool
//!
//! Every active SOCKS5 client endpoint owns one tunnel-side UDP connection,
//! cached here under the client's `host:port` key. The pool enforces a
//! maximum size by evicting a handful of the oldest entries, and a
//! lock-free "in creation" side table deduplicates concurrent first
//! datagrams so the tunnel is dialed exactly once per client.
//!
//! Locking: the map sits behind one `RwLock`; the in-creation set is a
//! `DashMap` precisely so a creation in flight never holds the pool lock.
//! No path here takes more than one of {pool lock, association write lock}
//! at a time.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::device::VirtualUdpConn;

/// How many entries a capacity eviction removes at most
const EVICTION_BATCH: usize = 5;

/// Receiver half of an association's shutdown channel.
pub type ShutdownReceiver = mpsc::Receiver<()>;

/// One client endpoint's tunnel-side connection and bookkeeping.
pub struct UdpAssociation {
    conn: Arc<dyn VirtualUdpConn>,
    last_used: Mutex<Instant>,
    /// Reply destination: the client's UDP endpoint
    pub client: SocketAddr,
    /// The IP actually dialed; reply headers are built from it
    pub resolved_ip: IpAddr,
    /// The original target port
    pub target_port: u16,
    shutdown_tx: mpsc::Sender<()>,
    write_lock: tokio::sync::Mutex<()>,
}

impl UdpAssociation {
    /// Wrap a freshly dialed connection. The returned receiver belongs to
    /// the association's reader task.
    #[must_use]
    pub fn new(
        conn: Arc<dyn VirtualUdpConn>,
        client: SocketAddr,
        resolved_ip: IpAddr,
        target_port: u16,
    ) -> (Arc<Self>, ShutdownReceiver) {
        // Single slot: a second shutdown signal while one is pending is
        // dropped, the reader will observe the first on its next timeout.
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let assoc = Arc::new(Self {
            conn,
            last_used: Mutex::new(Instant::now()),
            client,
            resolved_ip,
            target_port,
            shutdown_tx,
            write_lock: tokio::sync::Mutex::new(()),
        });
        (assoc, shutdown_rx)
    }

    /// The tunnel-side connection.
    #[must_use]
    pub fn conn(&self) -> &Arc<dyn VirtualUdpConn> {
        &self.conn
    }

    /// Refresh the recency timestamp.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// When the association was last used.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// How long the association has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Write one payload to the tunnel, serialized against other writers
    /// (the tunnel stack does not guarantee write atomicity).
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; callers treat it as best-effort.
    pub async fn write_payload(&self, payload: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.conn.send(payload).await.map(|_| ())
    }

    /// Non-blocking shutdown signal; dropped if one is already pending.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    fn teardown(&self) {
        self.signal_shutdown();
        self.conn.close();
    }
}

impl std::fmt::Debug for UdpAssociation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpAssociation")
            .field("client", &self.client)
            .field("resolved_ip", &self.resolved_ip)
            .field("target_port", &self.target_port)
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}

/// Pool of live associations keyed by client `host:port`.
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<UdpAssociation>>>,
    in_creation: DashMap<String, ()>,
    current_size: AtomicUsize,
    max_size: usize,
}

impl ConnectionPool {
    /// Create a pool holding at most `max_size` associations.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            in_creation: DashMap::new(),
            current_size: AtomicUsize::new(0),
            max_size,
        }
    }

    /// Look up an association, refreshing its recency on hit.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<UdpAssociation>> {
        let connections = self.connections.read();
        let assoc = connections.get(key)?;
        assoc.touch();
        Some(Arc::clone(assoc))
    }

    /// Register a new association, evicting the oldest entries first when
    /// the pool is full. Releases the creation marker for `key`.
    pub fn set(&self, key: String, assoc: Arc<UdpAssociation>) {
        let mut connections = self.connections.write();
        if connections.len() >= self.max_size {
            self.evict_oldest_locked(&mut connections);
        }
        assoc.touch();
        connections.insert(key.clone(), assoc);
        self.current_size.store(connections.len(), Ordering::Relaxed);
        drop(connections);

        self.in_creation.remove(&key);
    }

    /// Tear down and remove one association: signal its reader, close the
    /// tunnel connection, drop the map entry and the creation marker.
    pub fn delete(&self, key: &str) {
        let removed = {
            let mut connections = self.connections.write();
            let removed = connections.remove(key);
            self.current_size.store(connections.len(), Ordering::Relaxed);
            removed
        };
        if let Some(assoc) = removed {
            assoc.teardown();
            trace!(key, "association deleted");
        }
        self.in_creation.remove(key);
    }

    /// Delete every association idle for longer than `max_age`.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let expired: Vec<(String, Arc<UdpAssociation>)> = {
            let mut connections = self.connections.write();
            let keys: Vec<String> = connections
                .iter()
                .filter(|(_, assoc)| assoc.idle_for() > max_age)
                .map(|(key, _)| key.clone())
                .collect();
            let expired = keys
                .into_iter()
                .filter_map(|key| connections.remove(&key).map(|a| (key, a)))
                .collect();
            self.current_size.store(connections.len(), Ordering::Relaxed);
            expired
        };

        let removed = expired.len();
        for (key, assoc) in expired {
            assoc.teardown();
            self.in_creation.remove(&key);
        }
        if removed > 0 {
            debug!(removed, remaining = self.len(), "idle associations cleaned up");
        }
        removed
    }

    /// Claim the right to create the association for `key`.
    ///
    /// Returns `true` to exactly one caller until the claim is released by
    /// [`set`](Self::set), [`delete`](Self::delete) or
    /// [`end_creation`](Self::end_creation).
    #[must_use]
    pub fn try_begin_creation(&self, key: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.in_creation.entry(key.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                true
            }
        }
    }

    /// Release a creation claim after a failed dial or resolution.
    pub fn end_creation(&self, key: &str) {
        self.in_creation.remove(key);
    }

    /// Current number of live associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Evict up to [`EVICTION_BATCH`] of the approximately oldest entries.
    ///
    /// Single scan with a small candidate buffer: a key either fills a free
    /// slot or replaces the first buffered candidate newer than it. The
    /// selection is approximate by contract; what matters is that capacity
    /// pressure never blocks and fresh entries are not preferred victims.
    fn evict_oldest_locked(&self, connections: &mut HashMap<String, Arc<UdpAssociation>>) {
        if connections.len() <= EVICTION_BATCH {
            return;
        }

        let mut oldest: Vec<String> = Vec::with_capacity(EVICTION_BATCH);
        for (key, assoc) in connections.iter() {
            if oldest.len() < EVICTION_BATCH {
                oldest.push(key.clone());
                continue;
            }
            let candidate_used = assoc.last_used();
            for slot in &mut oldest {
                if candidate_used < connections[slot.as_str()].last_used() {
                    *slot = key.clone();
                    break;
                }
            }
        }

        for key in oldest {
            if let Some(assoc) = connections.remove(&key) {
                assoc.teardown();
                trace!(key, "association evicted for capacity");
            }
            self.in_creation.remove(&key);
        }
        self.current_size.store(connections.len(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("in_creation", &self.in_creation.len())
            .finish()
    }
}
