use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stream::{probe_liveness, Transport};

const MAX_IDLE: usize = 10;
const MAX_IDLE_TIME: Duration = Duration::from_secs(90);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// An idle, reusable transport parked in the pool.
pub struct PooledConnection {
    pub transport: Transport,
    pub last_used: Instant,
    pub protocol: String,
    pub peer_key: String,
    pub tls: bool,
    /// A byte the liveness probe may have consumed off a TLS connection
    /// that turned out to still be alive; replayed before the next read.
    pub pending_byte: Option<u8>,
}

impl PooledConnection {
    pub fn new(transport: Transport, protocol: String, peer_key: String, tls: bool) -> Self {
        Self { transport, last_used: Instant::now(), protocol, peer_key, tls, pending_byte: None }
    }
}

/// Per-peer LIFO cache of idle connections, keyed by `"ip:port"`. A single
/// mutex serializes every operation, including the background sweep, so
/// handouts and the sweep never interleave.
pub struct ConnectionPool {
    entries: Arc<Mutex<HashMap<String, Vec<PooledConnection>>>>,
    sweep_handle: JoinHandle<()>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        let entries: Arc<Mutex<HashMap<String, Vec<PooledConnection>>>> = Arc::new(Mutex::new(HashMap::new()));
        let sweep_entries = entries.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                sweep_once(&sweep_entries).await;
            }
        });
        Self { entries, sweep_handle }
    }

    /// Pops the most recently parked connection for `key`, if any, and
    /// probes its liveness before handing it out. A dead connection is
    /// closed and `None` is returned; this does not fall through to the
    /// next entry in the stack.
    pub async fn get(&self, key: &str) -> Option<PooledConnection> {
        let mut guard = self.entries.lock().await;
        let list = guard.get_mut(key)?;
        let mut conn = list.pop()?;
        if list.is_empty() {
            guard.remove(key);
        }
        drop(guard);

        let liveness = probe_liveness(&mut conn.transport).await;
        if !liveness.alive {
            debug!(%key, "pooled connection failed liveness probe, discarding");
            return None;
        }
        conn.pending_byte = liveness.consumed_byte;
        debug!(%key, "pool hit");
        Some(conn)
    }

    /// Parks `conn` for reuse. If the per-key list is already at `max_idle`,
    /// the connection is dropped (closed) instead of queued.
    pub async fn put(&self, key: String, mut conn: PooledConnection) {
        conn.last_used = Instant::now();
        let mut guard = self.entries.lock().await;
        let list = guard.entry(key.clone()).or_default();
        if list.len() >= MAX_IDLE {
            debug!(%key, "pool at capacity, closing connection instead of parking");
            return;
        }
        list.push(conn);
    }

    /// Closes every idle connection for `key` and removes the slot.
    pub async fn remove(&self, key: &str) {
        let mut guard = self.entries.lock().await;
        guard.remove(key);
    }

    /// Closes every idle connection across every key.
    pub async fn close_all(&self) {
        let mut guard = self.entries.lock().await;
        guard.clear();
    }

    /// Number of idle connections currently parked for `key`. Exposed for
    /// tests exercising the pool-cap and LIFO invariants.
    pub async fn idle_len(&self, key: &str) -> usize {
        let guard = self.entries.lock().await;
        guard.get(key).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.sweep_handle.abort();
    }
}

async fn sweep_once(entries: &Arc<Mutex<HashMap<String, Vec<PooledConnection>>>>) {
    let mut guard = entries.lock().await;
    let mut empty_keys = Vec::new();
    for (key, list) in guard.iter_mut() {
        let mut kept = Vec::with_capacity(list.len());
        for mut conn in list.drain(..) {
            if conn.last_used.elapsed() > MAX_IDLE_TIME {
                warn!(key = %key, "sweep closing connection past max idle time");
                continue;
            }
            let liveness = probe_liveness(&mut conn.transport).await;
            if !liveness.alive {
                warn!(key = %key, "sweep closing connection that failed liveness probe");
                continue;
            }
            conn.pending_byte = liveness.consumed_byte;
            kept.push(conn);
        }
        *list = kept;
        if list.is_empty() {
            empty_keys.push(key.clone());
        }
    }
    for key in empty_keys {
        guard.remove(&key);
    }
}
