//! Keyed session pool for remote backends.
//!
//! Sessions are keyed by [`Authority`]. Each authority has a checkout limit
//! enforced by a semaphore; returned sessions wait in an idle list until
//! they are reused or their idle time exceeds the TTL.
//!
//! Backends check sessions out through [`ConnectionPool::checkout`], which
//! stops waiting for a free slot when the token installed by
//! [`with_cancellation`] fires.

use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::error::{FileOpError, FileOpResult};
use crate::uri::Authority;

tokio::task_local! {
    static CANCEL: CancellationToken;
}

/// Run `fut` with `cx` as the token that session checkouts inside it wait on.
pub async fn with_cancellation<F: Future>(cx: &CancellationToken, fut: F) -> F::Output {
    CANCEL.scope(cx.clone(), fut).await
}

/// Opens sessions for one backend type.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self, authority: &Authority) -> FileOpResult<Self::Connection>;

    /// Cheap liveness check run before an idle session is reused.
    fn is_alive(&self, _conn: &Self::Connection) -> bool {
        true
    }

    fn close(&self, _conn: Self::Connection) {}
}

struct Slot<T> {
    permits: Arc<Semaphore>,
    idle: Vec<(T, Instant)>,
}

struct PoolInner<C: Connector> {
    connector: C,
    max_per_authority: usize,
    idle_ttl: Duration,
    slots: Mutex<HashMap<Authority, Slot<C::Connection>>>,
}

impl<C: Connector> PoolInner<C> {
    fn slots(&self) -> MutexGuard<'_, HashMap<Authority, Slot<C::Connection>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop slots with no idle session and no checkout or waiter holding
    /// their semaphore.
    fn prune(slots: &mut HashMap<Authority, Slot<C::Connection>>) {
        slots.retain(|_, slot| !slot.idle.is_empty() || Arc::strong_count(&slot.permits) > 1);
    }

    fn give_back(&self, authority: &Authority, conn: C::Connection) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(authority) {
            slot.idle.push((conn, Instant::now()));
            trace!("Session returned to pool: {}", authority);
        } else {
            drop(slots);
            self.connector.close(conn);
        }
    }

    /// Pop the most recently returned live session, closing stale ones.
    fn take_idle(&self, authority: &Authority) -> Option<C::Connection> {
        let mut stale = Vec::new();
        let found = {
            let mut slots = self.slots();
            let slot = slots.get_mut(authority)?;
            let ttl = self.idle_ttl;
            let (fresh, expired): (Vec<_>, Vec<_>) = slot
                .idle
                .drain(..)
                .partition(|(_, since)| since.elapsed() < ttl);
            slot.idle = fresh;
            stale.extend(expired.into_iter().map(|(conn, _)| conn));

            let mut found = None;
            while let Some((conn, _)) = slot.idle.pop() {
                if self.connector.is_alive(&conn) {
                    found = Some(conn);
                    break;
                }
                stale.push(conn);
            }
            found
        };

        for conn in stale {
            self.connector.close(conn);
        }
        found
    }
}

/// Pool of sessions, cheap to clone.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                max_per_authority: config.max_per_authority.max(1),
                idle_ttl: config.idle_ttl(),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    fn permits(&self, authority: &Authority) -> Arc<Semaphore> {
        let mut slots = self.inner.slots();
        if !slots.contains_key(authority) {
            PoolInner::<C>::prune(&mut slots);
        }
        slots
            .entry(authority.clone())
            .or_insert_with(|| Slot {
                permits: Arc::new(Semaphore::new(self.inner.max_per_authority)),
                idle: Vec::new(),
            })
            .permits
            .clone()
    }

    /// Check out a session, waiting while the authority is at its limit.
    pub async fn acquire(&self, authority: &Authority) -> FileOpResult<PooledConnection<C>> {
        let permit = self
            .permits(authority)
            .acquire_owned()
            .await
            .map_err(|_| FileOpError::ConnectionFailed {
                authority: authority.to_string(),
                reason: "pool closed".to_string(),
            })?;
        self.open(authority, permit).await
    }

    /// Like [`acquire`](Self::acquire) but gives up waiting when `cx` is
    /// cancelled. A free slot is still handed out after cancellation so
    /// cleanup work can run.
    pub async fn acquire_with_cancel(
        &self,
        authority: &Authority,
        cx: &CancellationToken,
    ) -> FileOpResult<PooledConnection<C>> {
        if let Ok(permit) = self.permits(authority).try_acquire_owned() {
            return self.open(authority, permit).await;
        }
        tokio::select! {
            biased;
            _ = cx.cancelled() => {
                debug!("Stopped waiting for a session: {}", authority);
                Err(FileOpError::Cancelled(authority.to_string()))
            }
            acquired = self.acquire(authority) => acquired,
        }
    }

    /// Check out a session under the token of the enclosing
    /// [`with_cancellation`] scope, if any.
    pub async fn checkout(&self, authority: &Authority) -> FileOpResult<PooledConnection<C>> {
        match CANCEL.try_with(CancellationToken::clone) {
            Ok(cx) => self.acquire_with_cancel(authority, &cx).await,
            Err(_) => self.acquire(authority).await,
        }
    }

    async fn open(
        &self,
        authority: &Authority,
        permit: OwnedSemaphorePermit,
    ) -> FileOpResult<PooledConnection<C>> {
        let conn = match self.inner.take_idle(authority) {
            Some(conn) => {
                trace!("Reusing pooled session: {}", authority);
                conn
            }
            None => {
                debug!("Opening session: {}", authority);
                self.inner.connector.connect(authority).await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            authority: authority.clone(),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Return a session; invalid sessions are closed instead of pooled.
    pub fn release(&self, conn: PooledConnection<C>, valid: bool) {
        if valid {
            drop(conn);
        } else {
            conn.invalidate();
        }
    }

    /// Close idle sessions older than the TTL. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let ttl = self.inner.idle_ttl;
        let mut expired = Vec::new();
        {
            let mut slots = self.inner.slots();
            for slot in slots.values_mut() {
                let (fresh, old): (Vec<_>, Vec<_>) = slot
                    .idle
                    .drain(..)
                    .partition(|(_, since)| since.elapsed() < ttl);
                slot.idle = fresh;
                expired.extend(old.into_iter().map(|(conn, _)| conn));
            }
            PoolInner::<C>::prune(&mut slots);
        }

        let count = expired.len();
        for conn in expired {
            self.inner.connector.close(conn);
        }
        if count > 0 {
            debug!("Evicted {} idle session(s)", count);
        }
        count
    }

    /// Background task that evicts idle sessions until `cx` is cancelled.
    pub fn spawn_reaper(&self, cx: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = (pool.inner.idle_ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cx.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        pool.evict_idle();
                    }
                }
            }
            trace!("Pool reaper stopped");
        })
    }

    /// Close every idle session regardless of age.
    pub fn close_idle(&self) {
        let drained: Vec<C::Connection> = {
            let mut slots = self.inner.slots();
            let drained = slots
                .values_mut()
                .flat_map(|slot| slot.idle.drain(..).map(|(conn, _)| conn))
                .collect();
            PoolInner::<C>::prune(&mut slots);
            drained
        };
        for conn in drained {
            self.inner.connector.close(conn);
        }
    }

    /// Authorities with idle or checked-out sessions.
    pub fn authority_count(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn idle_count(&self, authority: &Authority) -> usize {
        self.inner
            .slots()
            .get(authority)
            .map(|slot| slot.idle.len())
            .unwrap_or(0)
    }

    /// Sessions currently checked out for `authority`.
    pub fn in_use(&self, authority: &Authority) -> usize {
        self.inner
            .slots()
            .get(authority)
            .map(|slot| self.inner.max_per_authority - slot.permits.available_permits())
            .unwrap_or(0)
    }
}

/// A checked-out session. Dropping it returns the session to the pool.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    authority: Authority,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Close the session instead of returning it.
    pub fn invalidate(mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("Discarding invalid session: {}", self.authority);
            self.pool.connector.close(conn);
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `invalidate` and `drop` take the session, and both consume self
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled session already released"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled session already released"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(&self.authority, conn);
        }
    }
}
