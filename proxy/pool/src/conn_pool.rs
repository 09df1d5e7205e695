// Copyright 2022 SphereEx Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    error::Error,
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use futures::future;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// In order to be managed by the connection pool, Both the `ConnLike` and `ConnAttr` trait
/// needs to be implemented. The value handed to `Pool::new` acts as the factory, every
/// pooled connection is created by calling `build_conn` on it.
#[async_trait]
pub trait ConnLike: Sized + Send + Sync + fmt::Debug + 'static {
    type Error: Error + Send + Sync + 'static;

    // Method for create connection
    async fn build_conn(&self) -> Result<Self, Self::Error>;

    // Close the physical connection
    async fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// `ConnAttr` traits is used to get attribute of current connection
pub trait ConnAttr {
    fn get_endpoint(&self) -> String;
    // Get current db on conn
    fn get_db(&self) -> Option<String>;
    // Get current autocommit status, `None` when unknown
    fn get_autocommit(&self) -> Option<bool>;
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out waiting for a connection")]
    Timeout,

    #[error("connection request canceled")]
    Canceled,

    #[error("connection pool is closed")]
    Closed,

    #[error("build connection failed: {0}")]
    Build(#[source] Box<dyn Error + Send + Sync>),
}

/// Per-request acquisition context: a cancellation token plus an optional
/// deadline. Only waiting for a connection honours it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Context {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Context {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    // Returns the reason this context is already done, if any.
    fn done(&self) -> Option<PoolError> {
        if self.cancel.is_cancelled() {
            return Some(PoolError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(PoolError::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub reused: u64,
    pub idle_expired: u64,
    pub discarded: u64,
    pub timeouts: u64,
}

#[derive(Debug)]
struct IdleConn<T> {
    conn: T,
    since: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    idle_expired: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug)]
struct PoolInner<T: ConnLike + ConnAttr> {
    factory: T,
    capacity: usize,
    idle_timeout: Option<Duration>,
    // one permit per live connection
    permits: Arc<Semaphore>,
    idle: ArrayQueue<IdleConn<T>>,
    in_use: AtomicUsize,
    closed: AtomicBool,
    counters: Counters,
}

impl<T: ConnLike + ConnAttr> PoolInner<T> {
    fn is_expired(&self, idle: &IdleConn<T>) -> bool {
        match self.idle_timeout {
            Some(timeout) => idle.since.elapsed() >= timeout,
            None => false,
        }
    }

    // Close a connection outside of an async context.
    fn close_detached(&self, conn: T) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_conn(conn));
            }
            Err(_) => {
                warn!(endpoint = %conn.get_endpoint(), "no runtime to close connection, dropping it");
            }
        }
    }

    fn push_idle(&self, conn: T) {
        if let Err(idle) = self.idle.push(IdleConn { conn, since: Instant::now() }) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            self.close_detached(idle.conn);
            return;
        }

        // a concurrent close may have drained the queue before the push landed
        if self.closed.load(Ordering::SeqCst) {
            while let Some(idle) = self.idle.pop() {
                self.close_detached(idle.conn);
            }
        }
    }
}

// Close a connection the pool gives up on, failures are only logged.
async fn close_conn<T: ConnLike + ConnAttr>(conn: T) {
    let endpoint = conn.get_endpoint();
    if let Err(e) = conn.close().await {
        warn!(endpoint = %endpoint, error = %e, "close connection failed");
    }
}

/// A bounded pool of connections to a single backend instance.
///
/// At most `capacity` connections exist at any time, counting both idle and
/// handed out ones. Waiters are served in FIFO order.
#[derive(Debug)]
pub struct Pool<T: ConnLike + ConnAttr> {
    inner: Arc<PoolInner<T>>,
}

impl<T: ConnLike + ConnAttr> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool { inner: Arc::clone(&self.inner) }
    }
}

impl<T: ConnLike + ConnAttr> Pool<T> {
    pub fn new(factory: T, capacity: usize, idle_timeout: Option<Duration>) -> Pool<T> {
        let capacity = capacity.max(1);
        Pool {
            inner: Arc::new(PoolInner {
                factory,
                capacity,
                idle_timeout,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: ArrayQueue::new(capacity),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn endpoint(&self) -> String {
        self.inner.factory.get_endpoint()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Get a connection, waiting until one is idle, one can be created below
    /// capacity, or `ctx` is done. `ctx` also bounds building a new connection.
    pub async fn get(&self, ctx: &Context) -> Result<PoolConn<T>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if let Some(err) = ctx.done() {
            return Err(self.note(err));
        }

        let deadline = async {
            match ctx.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let permit = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => return Err(PoolError::Canceled),
            _ = &mut deadline => return Err(self.note(PoolError::Timeout)),
            res = Arc::clone(&self.inner.permits).acquire_owned() => {
                res.map_err(|_| PoolError::Closed)?
            }
        };

        while let Some(idle) = self.inner.idle.pop() {
            if self.inner.is_expired(&idle) {
                debug!(endpoint = %idle.conn.get_endpoint(), "evict expired idle connection");
                self.inner.counters.idle_expired.fetch_add(1, Ordering::Relaxed);
                close_conn(idle.conn).await;
                continue;
            }

            self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(self.hand_out(idle.conn, permit));
        }

        // the permit is released if the context finishes first
        let conn = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => return Err(PoolError::Canceled),
            _ = &mut deadline => return Err(self.note(PoolError::Timeout)),
            res = self.inner.factory.build_conn() => {
                res.map_err(|e| PoolError::Build(Box::new(e)))?
            }
        };
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %conn.get_endpoint(), "create new connection");

        Ok(self.hand_out(conn, permit))
    }

    fn hand_out(&self, conn: T, permit: OwnedSemaphorePermit) -> PoolConn<T> {
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        PoolConn { pool: Arc::clone(&self.inner), conn: Some(conn), permit: Some(permit) }
    }

    fn note(&self, err: PoolError) -> PoolError {
        if let PoolError::Timeout = err {
            self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        err
    }

    /// Close idle connections that outlived `idle_timeout`. Returns how many
    /// were closed.
    pub async fn reap_idle(&self) -> usize {
        if self.inner.idle_timeout.is_none() {
            return 0;
        }

        let mut kept = Vec::new();
        let mut reaped = 0;
        for _ in 0..self.inner.idle.len() {
            // Holding a permit keeps a concurrent `get` from building past capacity
            // while the idle connection is out of the queue.
            let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let idle = match self.inner.idle.pop() {
                Some(idle) => idle,
                None => break,
            };

            if self.inner.is_expired(&idle) {
                self.inner.counters.idle_expired.fetch_add(1, Ordering::Relaxed);
                close_conn(idle.conn).await;
                reaped += 1;
            } else {
                kept.push((idle, permit));
            }
        }

        for (idle, permit) in kept {
            if let Err(idle) = self.inner.idle.push(idle) {
                close_conn(idle.conn).await;
            }
            drop(permit);
        }

        if reaped > 0 {
            debug!(endpoint = %self.endpoint(), reaped, "reaped idle connections");
        }
        reaped
    }

    /// Close the pool: pending and future `get` calls fail with `Closed`, idle
    /// connections are closed now and in-use ones when they come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        while let Some(idle) = self.inner.idle.pop() {
            close_conn(idle.conn).await;
        }
        debug!(endpoint = %self.endpoint(), "connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.len();
        let in_use = self.inner.in_use.load(Ordering::Relaxed);
        let counters = &self.inner.counters;
        PoolStats {
            capacity: self.inner.capacity,
            live: idle + in_use,
            idle,
            in_use,
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            idle_expired: counters.idle_expired.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A connection checked out of a `Pool`. It must be settled with `put_back`
/// or `error_close`, dropping it unsettled discards the connection.
#[derive(Debug)]
pub struct PoolConn<T: ConnLike + ConnAttr> {
    pool: Arc<PoolInner<T>>,
    conn: Option<T>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<T: ConnLike + ConnAttr> PoolConn<T> {
    fn settle(&mut self) -> Option<(T, Option<OwnedSemaphorePermit>)> {
        let conn = self.conn.take()?;
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        Some((conn, self.permit.take()))
    }

    /// Return a healthy connection to the idle set.
    pub fn put_back(mut self) {
        let (conn, permit) = match self.settle() {
            Some(settled) => settled,
            None => return,
        };

        if self.pool.closed.load(Ordering::SeqCst) {
            self.pool.close_detached(conn);
            return;
        }

        debug!(endpoint = %conn.get_endpoint(), "put back connection");
        // Push before the permit is released so a woken waiter finds it.
        self.pool.push_idle(conn);
        drop(permit);
    }

    /// Destroy a connection whose protocol state can no longer be trusted.
    /// Returns the error of closing it, capacity is released either way.
    pub async fn error_close(mut self) -> Result<(), T::Error> {
        let (conn, permit) = match self.settle() {
            Some(settled) => settled,
            None => return Ok(()),
        };

        debug!(endpoint = %conn.get_endpoint(), "close broken connection");
        self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
        let res = conn.close().await;
        drop(permit);
        res
    }
}

impl<T: ConnLike + ConnAttr> Deref for PoolConn<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("PoolConn used after settle"),
        }
    }
}

impl<T: ConnLike + ConnAttr> DerefMut for PoolConn<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("PoolConn used after settle"),
        }
    }
}

impl<T: ConnLike + ConnAttr> Drop for PoolConn<T> {
    fn drop(&mut self) {
        if let Some((conn, permit)) = self.settle() {
            warn!(endpoint = %conn.get_endpoint(), "pooled connection dropped without settle, discarding");
            self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            self.pool.close_detached(conn);
            drop(permit);
        }
    }
}
