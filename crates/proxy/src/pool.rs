//! Worker threads serving connections pulled from a shared queue.
//!
//! Workers block on the connection they serve, so the pool grows instead of queueing: a
//! connection pushed while no worker is idle gets a new worker. Idle workers above the
//! configured minimum retire after the idle timeout.

use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::ProxyConfig;
use crate::connection::Connection;

/// What became of a connection after one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The connection stays open and goes back to the queue for its next request
    KeepAlive,
    /// The pool closes the connection
    Close,
    /// The socket was handed to someone else, the pool forgets it
    Delegated,
}

/// Serves one request of a connection, called on a worker thread.
pub trait ConnectionService: Send + Sync + 'static {
    fn serve(&self, connection: &Arc<Connection>) -> ExchangeOutcome;
}

impl<F> ConnectionService for F
where
    F: Fn(&Arc<Connection>) -> ExchangeOutcome + Send + Sync + 'static,
{
    fn serve(&self, connection: &Arc<Connection>) -> ExchangeOutcome {
        (self)(connection)
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<Connection>>,
    idle: usize,
    closed: bool,
}

enum Pop {
    Item(Arc<Connection>),
    Timeout,
    Closed,
}

/// Connections waiting for a worker.
#[derive(Default)]
struct ConnectionQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ConnectionQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if no idle worker is left to take the connection.
    fn push(&self, connection: Arc<Connection>) -> Result<bool, Arc<Connection>> {
        let mut state = self.lock();
        if state.closed {
            return Err(connection);
        }
        state.items.push_back(connection);
        let needs_worker = state.idle < state.items.len();
        drop(state);
        self.available.notify_one();
        Ok(needs_worker)
    }

    fn pop(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(connection) = state.items.pop_front() {
                return Pop::Item(connection);
            }
            if state.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Timeout;
            }

            state.idle += 1;
            let (next, _) = self.available.wait_timeout(state, deadline - now).unwrap_or_else(PoisonError::into_inner);
            state = next;
            state.idle -= 1;
        }
    }

    fn close(&self) -> Vec<Arc<Connection>> {
        let mut state = self.lock();
        state.closed = true;
        let pending = state.items.drain(..).collect();
        drop(state);
        self.available.notify_all();
        pending
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }
}

struct PoolShared {
    queue: ConnectionQueue,
    service: Arc<dyn ConnectionService>,
    live: AtomicUsize,
    next_id: AtomicUsize,
    min_workers: usize,
    idle_timeout: Duration,
}

/// Cloneable handle of the worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("live", &self.live_workers())
            .field("queued", &self.shared.queue.len())
            .field("min_workers", &self.shared.min_workers)
            .finish()
    }
}

impl WorkerPool {
    /// Starts the minimum number of workers.
    pub fn start(config: &ProxyConfig, service: Arc<dyn ConnectionService>) -> io::Result<Self> {
        let pool = Self {
            shared: Arc::new(PoolShared {
                queue: ConnectionQueue::default(),
                service,
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                min_workers: config.worker_min,
                idle_timeout: config.worker_idle_timeout(),
            }),
        };
        for _ in 0..config.worker_min {
            pool.spawn_worker()?;
        }
        info!(workers = config.worker_min, "worker pool started");
        Ok(pool)
    }

    /// Queues a connection, starting a worker if every worker is busy.
    pub fn submit(&self, connection: Arc<Connection>) {
        match self.shared.queue.push(connection) {
            Ok(true) => {
                if let Err(e) = self.spawn_worker() {
                    error!(cause = %e, "can't start worker, connection waits for a busy one");
                }
            }
            Ok(false) => {}
            Err(connection) => {
                debug!(token = connection.token().0, "pool is closed, dropping connection");
                connection.abort();
            }
        }
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Stops taking connections, aborts those still queued and lets workers exit once
    /// their current exchange is over.
    pub fn shutdown(&self) {
        let pending = self.shared.queue.close();
        info!(pending = pending.len(), "worker pool shutdown");
        for connection in pending {
            connection.abort();
        }
    }

    fn spawn_worker(&self) -> io::Result<()> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        shared.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new().name(format!("intercept-worker-{id}")).spawn(move || worker_loop(id, shared));
        if let Err(e) = spawned {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        trace!(worker = id, "worker spawned");
        Ok(())
    }
}

fn worker_loop(id: usize, shared: Arc<PoolShared>) {
    debug!(worker = id, "worker started");
    loop {
        match shared.queue.pop(shared.idle_timeout) {
            Pop::Item(connection) => serve(&shared, connection),
            Pop::Timeout => {
                if retire(&shared) {
                    debug!(worker = id, "idle worker retired");
                    return;
                }
            }
            Pop::Closed => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                debug!(worker = id, "worker stopped");
                return;
            }
        }
    }
}

/// Takes the calling worker out of the live count unless that would go below the minimum.
fn retire(shared: &PoolShared) -> bool {
    shared
        .live
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| if live > shared.min_workers { Some(live - 1) } else { None })
        .is_ok()
}

fn serve(shared: &PoolShared, connection: Arc<Connection>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| shared.service.serve(&connection)));
    match outcome {
        Ok(ExchangeOutcome::KeepAlive) => {
            if let Err(connection) = shared.queue.push(connection) {
                connection.abort();
            }
        }
        Ok(ExchangeOutcome::Close) => connection.close(),
        Ok(ExchangeOutcome::Delegated) => {}
        Err(_) => {
            warn!(token = connection.token().0, "exchange panicked, aborting connection");
            connection.abort();
        }
    }
}
