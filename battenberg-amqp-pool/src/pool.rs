//! The connection pool: leases counted against a per-connection link budget, with idle
//! connections reaped on a delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use battenberg_amqp::transport::{Connection, ConnectionFactory};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tracing::debug;

/// How many links a single AMQP connection is allowed to carry (the `handle-max` we
/// negotiate).
pub(crate) const DEFAULT_LINK_BUDGET: u32 = 255;

/// How long a connection sits idle (zero leased links) before it is disconnected.
pub(crate) const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(600);

type ConnectionResult = Result<Arc<dyn Connection>, Arc<anyhow::Error>>;
type SharedConnection = Shared<BoxFuture<'static, ConnectionResult>>;

/// Tunables for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of links leased against one connection. Default: 255.
    pub link_budget: u32,
    /// Delay before an idle connection is disconnected. Default: 10 minutes.
    pub idle_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            link_budget: DEFAULT_LINK_BUDGET,
            idle_delay: DEFAULT_IDLE_DELAY,
        }
    }
}

/// A pool of shared AMQP connections, handing out link leases.
///
/// Cloning is cheap; all clones share the same pool state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: ConnectionFactory,
    options: PoolOptions,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    /// Insertion-ordered: `lease` scans from the oldest connection first.
    entries: Vec<PoolEntry>,
    disposed: bool,
}

struct PoolEntry {
    id: u64,
    connection: SharedConnection,
    link_refcount: u32,
    /// Armed exactly while `link_refcount == 0`; cancelled when the entry is re-leased.
    idle_timer: Option<JoinHandle<()>>,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self::with_options(factory, PoolOptions::default())
    }

    pub fn with_options(factory: ConnectionFactory, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                options,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Lease `num_links` link handles.
    ///
    /// Scans existing connections in insertion order and reuses the first with enough
    /// budget left, cancelling any pending idle-cleanup timer on it. When none has room, a
    /// new connection is opened in the background and the lease resolves it on demand via
    /// [`ConnectionLease::connection`].
    pub fn lease(&self, num_links: u32) -> Result<ConnectionLease, crate::Error> {
        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        if state.disposed {
            return Err(anyhow::anyhow!("the connection pool has been disposed").into());
        }

        for entry in state.entries.iter_mut() {
            if entry.link_refcount + num_links <= self.inner.options.link_budget {
                entry.link_refcount += num_links;
                if let Some(timer) = entry.idle_timer.take() {
                    timer.abort();
                }
                return Ok(ConnectionLease {
                    pool: Arc::clone(&self.inner),
                    entry_id: entry.id,
                    num_links,
                    connection: entry.connection.clone(),
                    released: AtomicBool::new(false),
                });
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let factory = self.inner.factory.clone();
        let connection: SharedConnection = async move {
            factory.new_connection().await.map_err(Arc::new)
        }
        .boxed()
        .shared();
        // Open eagerly rather than on the first `connection()` call.
        tokio::spawn(connection.clone().map(drop));

        debug!(connection_id = id, "opening a new pooled connection");
        state.entries.push(PoolEntry {
            id,
            connection: connection.clone(),
            link_refcount: num_links,
            idle_timer: None,
        });

        Ok(ConnectionLease {
            pool: Arc::clone(&self.inner),
            entry_id: id,
            num_links,
            connection,
            released: AtomicBool::new(false),
        })
    }

    /// The number of connections currently owned by the pool.
    pub fn size(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("pool state lock poisoned")
            .entries
            .len()
    }

    /// Disconnect every pooled connection and clear the pool.
    ///
    /// Outstanding leases are invalidated: their `release` calls become no-ops.
    pub async fn dispose(&self) {
        let entries = {
            let mut state = self.inner.state.lock().expect("pool state lock poisoned");
            state.disposed = true;
            std::mem::take(&mut state.entries)
        };
        for entry in entries {
            if let Some(timer) = entry.idle_timer {
                timer.abort();
            }
            if let Ok(connection) = entry.connection.await {
                let _ = connection.close().await;
            }
        }
    }
}

impl PoolInner {
    fn release(inner: &Arc<Self>, entry_id: u64, num_links: u32) {
        let mut state = inner.state.lock().expect("pool state lock poisoned");
        if state.disposed {
            return;
        }
        let Some(entry) = state.entries.iter_mut().find(|e| e.id == entry_id) else {
            return;
        };
        entry.link_refcount = entry.link_refcount.saturating_sub(num_links);
        if entry.link_refcount == 0 && entry.idle_timer.is_none() {
            let pool = Arc::clone(inner);
            let idle_delay = inner.options.idle_delay;
            entry.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(idle_delay).await;
                Self::reap(&pool, entry_id).await;
            }));
        }
    }

    /// Idle-cleanup: remove the entry (so no new lessee can grab it) and disconnect.
    ///
    /// A lease that slipped in between the timer firing and this running wins: the entry
    /// stays.
    async fn reap(inner: &Arc<Self>, entry_id: u64) {
        let reaped = {
            let mut state = inner.state.lock().expect("pool state lock poisoned");
            match state
                .entries
                .iter()
                .position(|e| e.id == entry_id && e.link_refcount == 0)
            {
                Some(position) => Some(state.entries.remove(position)),
                None => None,
            }
        };
        if let Some(entry) = reaped {
            debug!(connection_id = entry_id, "disconnecting idle pooled connection");
            if let Ok(connection) = entry.connection.await {
                let _ = connection.close().await;
            }
        }
    }
}

/// A lease of link handles against one pooled connection.
///
/// The lease exposes the connection behind a shared future: every lessee of the same
/// connection awaits the same open attempt. Call [`release`](Self::release) when the links
/// are gone; dropping the lease releases it as well. Releasing more than once is a no-op.
pub struct ConnectionLease {
    pool: Arc<PoolInner>,
    entry_id: u64,
    num_links: u32,
    connection: SharedConnection,
    released: AtomicBool,
}

impl ConnectionLease {
    /// Resolve the connection this lease counts against.
    pub async fn connection(&self) -> Result<Arc<dyn Connection>, crate::Error> {
        self.connection
            .clone()
            .await
            .map_err(|e| anyhow::Error::msg(format!("{e:#}")).into())
    }

    /// Return the leased links to the pool.
    ///
    /// When this was the last lease on the connection, an idle-cleanup timer is armed.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            PoolInner::release(&self.pool, self.entry_id, self.num_links);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release();
    }
}
