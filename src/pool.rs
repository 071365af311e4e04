//! Bounded connection pool for the relational store.
//!
//! Hand-built arena rather than a pooling library: a semaphore bounds the
//! total number of live connections (`size` baseline plus `max_overflow`
//! transient extras), and a free-list holds idle ones. Every connection
//! pulled from the free-list is liveness-checked before being handed out and
//! discarded past its recycle age, which keeps a fronting proxy from handing
//! us silently closed sockets. Every returned connection is rolled back
//! before it can be reused.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::store::{Connector, StoreConn, StoreError};

/// How many failed fresh-connect attempts acquire() will make before
/// escalating to the caller. Dead idle connections do not count against
/// this budget; they are discarded and replaced silently.
const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No capacity became available within the acquisition timeout.
    /// Retryable: the resource is busy, not broken.
    #[error("timed out waiting for a pooled connection after {0:?}")]
    AcquireTimeout(Duration),
    /// Capacity was available but no fresh connection could be opened
    /// within the attempt budget.
    #[error("gave up acquiring a valid connection after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Baseline connections kept idle in the free-list.
    pub size: usize,
    /// Transient connections allowed beyond the baseline; closed instead of
    /// pooled when released.
    pub max_overflow: usize,
    /// Bounded wait for capacity before `AcquireTimeout`.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are discarded, not reused.
    pub recycle_after: Duration,
    /// Most-recently-used-first reuse keeps the touched-connection set small
    /// under light load; `false` selects first-in-first-out.
    pub use_lifo: bool,
}

impl PoolOptions {
    pub fn from_config(db: &DatabaseConfig) -> Self {
        Self {
            size: db.pool_size,
            max_overflow: db.max_overflow,
            acquire_timeout: db.pool_timeout,
            recycle_after: db.pool_recycle,
            use_lifo: db.pool_use_lifo,
        }
    }
}

struct Idle<T> {
    conn: T,
    created_at: Instant,
}

struct Inner<C: Connector> {
    connector: C,
    opts: PoolOptions,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Idle<C::Conn>>>,
}

/// Process-wide pool handle. Cheap to clone; all clones share one arena.
pub struct Pool<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A checked-out connection. Release it with [`Pool::release`] to return it
/// to the free-list; dropping it instead closes the connection (capacity is
/// freed either way, but a dropped connection never re-enters the pool).
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    created_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> std::fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> std::ops::Deref for PooledConn<C> {
    type Target = C::Conn;
    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("connection present until release")
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, opts: PoolOptions) -> Self {
        let capacity = opts.size + opts.max_overflow;
        Self {
            inner: Arc::new(Inner {
                connector,
                opts,
                semaphore: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(VecDeque::with_capacity(opts.size)),
            }),
        }
    }

    /// Acquire a validated connection, waiting at most the configured
    /// timeout for capacity. Dead or over-age idle connections are discarded
    /// and transparently replaced by fresh ones; the caller only sees an
    /// error once the fresh-connect budget is spent.
    pub async fn acquire(&self) -> Result<PooledConn<C>, PoolError> {
        let timeout = self.inner.opts.acquire_timeout;
        let permit = tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::AcquireTimeout(timeout))?
        .expect("pool semaphore is never closed");

        let (conn, created_at) = self.checkout().await?;
        Ok(PooledConn {
            conn: Some(conn),
            created_at,
            _permit: permit,
        })
    }

    async fn checkout(&self) -> Result<(C::Conn, Instant), PoolError> {
        let mut attempts = 0u32;
        loop {
            let candidate = {
                let mut idle = self.inner.idle.lock().unwrap();
                if self.inner.opts.use_lifo {
                    idle.pop_back()
                } else {
                    idle.pop_front()
                }
            };
            match candidate {
                Some(mut entry) => {
                    if entry.created_at.elapsed() >= self.inner.opts.recycle_after {
                        debug!("discarding idle connection past recycle age");
                        continue;
                    }
                    match entry.conn.ping().await {
                        Ok(()) => return Ok((entry.conn, entry.created_at)),
                        // A dead pooled connection says nothing about the
                        // server's health, so it does not count against the
                        // connect budget. The free-list is finite; once it
                        // drains we fall through to a fresh connect.
                        Err(err) => {
                            warn!(error = %err, "discarding dead pooled connection");
                        }
                    }
                }
                None => match self.inner.connector.connect().await {
                    Ok(conn) => return Ok((conn, Instant::now())),
                    Err(err) => {
                        warn!(error = %err, "failed to open a fresh connection");
                        attempts += 1;
                        if attempts >= CONNECT_ATTEMPTS {
                            return Err(PoolError::Exhausted {
                                attempts,
                                source: err,
                            });
                        }
                    }
                },
            }
        }
    }

    /// Return a connection to the pool. Any open transaction is rolled back
    /// first; a connection that fails the rollback is closed instead of
    /// pooled. Beyond the baseline size the connection is treated as
    /// overflow and closed.
    pub async fn release(&self, mut handle: PooledConn<C>) {
        let Some(mut conn) = handle.conn.take() else {
            return;
        };
        match conn.rollback().await {
            Ok(()) => {
                let mut idle = self.inner.idle.lock().unwrap();
                if idle.len() < self.inner.opts.size {
                    idle.push_back(Idle {
                        conn,
                        created_at: handle.created_at,
                    });
                } else {
                    debug!("closing overflow connection");
                }
            }
            Err(err) => {
                warn!(error = %err, "closing connection that failed reset-on-return");
            }
        }
        // The permit drops with `handle`, waking the next waiter.
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }
}
