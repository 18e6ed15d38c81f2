//! Per-session signaling connection registry.
//!
//! At most one live connection exists per session id, shared by every
//! concurrent consumer (multiple UI surfaces on the same session). The
//! registry reference-counts acquisitions; the last release starts a
//! grace-period teardown so a quick remount reuses the live connection
//! instead of reconnecting. Consumers never close the transport directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;

use super::SignalClient;

/// Grace period between the last release and the actual transport close.
pub const POOL_LINGER: Duration = Duration::from_secs(10);

/// A pooled resource the registry can tear down.
pub trait PoolClose: Send + Sync + 'static {
    fn close(&self);
}

impl PoolClose for SignalClient {
    fn close(&self) {
        SignalClient::close(self);
    }
}

type ConnectFn<T> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync>;

struct Entry<T> {
    conn: Arc<T>,
    refcount: usize,
    /// Bumped on every acquire; a pending teardown only fires if the
    /// generation it captured is still current.
    generation: u64,
    teardown: Option<JoinHandle<()>>,
}

/// Registry of live signaling connections, keyed by session id.
pub struct SignalingPool<T: PoolClose> {
    connect: ConnectFn<T>,
    linger: Duration,
    entries: Arc<Mutex<HashMap<String, Entry<T>>>>,
}

impl<T: PoolClose> Clone for SignalingPool<T> {
    fn clone(&self) -> Self {
        Self {
            connect: Arc::clone(&self.connect),
            linger: self.linger,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: PoolClose> SignalingPool<T> {
    pub fn new<F>(connect: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync + 'static,
    {
        Self::with_linger(connect, POOL_LINGER)
    }

    pub fn with_linger<F>(connect: F, linger: Duration) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync + 'static,
    {
        Self {
            connect: Arc::new(connect),
            linger,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the connection for a session, connecting on first use.
    /// Cancels any pending grace-period teardown.
    pub async fn acquire(&self, session_id: &str) -> Result<Arc<T>> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(session_id) {
            if let Some(handle) = entry.teardown.take() {
                handle.abort();
            }
            entry.refcount += 1;
            entry.generation += 1;
            tracing::debug!(
                "Signaling pool reuse (session {}, refcount {})",
                session_id,
                entry.refcount
            );
            return Ok(Arc::clone(&entry.conn));
        }

        let conn = (self.connect)(session_id.to_string()).await?;
        entries.insert(
            session_id.to_string(),
            Entry {
                conn: Arc::clone(&conn),
                refcount: 1,
                generation: 0,
                teardown: None,
            },
        );
        tracing::debug!("Signaling pool connect (session {})", session_id);
        Ok(conn)
    }

    /// Release one reference. When the count reaches zero a grace-period
    /// teardown is scheduled; a re-acquisition within the grace period
    /// cancels it.
    pub async fn release(&self, session_id: &str) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }

        let generation = entry.generation;
        let linger = self.linger;
        let map = Arc::clone(&self.entries);
        let sid = session_id.to_string();

        entry.teardown = Some(tokio::spawn(async move {
            time::sleep(linger).await;
            let mut entries = map.lock().await;
            let close = match entries.get(&sid) {
                Some(e) if e.refcount == 0 && e.generation == generation => true,
                _ => false,
            };
            if close {
                if let Some(e) = entries.remove(&sid) {
                    tracing::debug!("Signaling pool teardown (session {})", sid);
                    e.conn.close();
                }
            }
        }));
    }

    /// Whether a live (possibly lingering) connection exists for a session.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().await.contains_key(session_id)
    }
}
