#![deny(missing_docs)]
//! Worker-thread executor for reaction bodies.
//!
//! A [`ThreadPool`] accepts opaque tasks, runs them on a fixed set of worker
//! threads, and reports task failures through an asynchronous error channel
//! instead of killing the worker. Workers that park inside a
//! [`blocking_section`](ThreadPool::blocking_section) are counted separately;
//! while every live worker is parked the pool grows by ephemeral replacement
//! workers (up to a configured surplus) so that parked tasks waiting on other
//! tasks cannot starve the queue.
//!
//! Pools are created from an explicit [`PoolConfig`]; there is no ambient
//! process-global executor.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use parking_lot::Mutex;
use thiserror::Error;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long an ephemeral replacement worker idles before re-checking whether
/// it is still needed.
const EPHEMERAL_IDLE_POLL: Duration = Duration::from_millis(50);

thread_local! {
    static CURRENT_POOL: RefCell<Option<Weak<PoolInner>>> = const { RefCell::new(None) };
}

/// Configuration for a [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Name used for worker thread names and error reports.
    pub name: String,
    /// Number of core worker threads.
    pub threads: usize,
    /// Maximum number of ephemeral replacement workers spawned while core
    /// workers are parked in blocking sections.
    pub max_extra: usize,
}

impl PoolConfig {
    /// Creates a config with the given pool name and default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: 4,
            max_extra: 16,
        }
    }

    /// Sets the number of core worker threads.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Sets the replacement-worker surplus cap.
    pub fn max_extra(mut self, max_extra: usize) -> Self {
        self.max_extra = max_extra;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new("retort-pool")
    }
}

/// Error returned when submitting work to a pool that has shut down.
#[derive(Debug, Error)]
#[error("thread pool `{pool}` is closed")]
pub struct PoolClosed {
    /// Name of the closed pool.
    pub pool: String,
}

/// Failure report delivered through the pool's error channel.
#[derive(Clone, Debug)]
pub struct PoolError {
    /// Name of the reporting pool.
    pub pool: String,
    /// Label identifying the failed unit of work.
    pub origin: String,
    /// Human-readable failure description.
    pub message: String,
}

struct PoolInner {
    name: String,
    target: usize,
    max_extra: usize,
    tx: Mutex<Option<Sender<Task>>>,
    rx: Receiver<Task>,
    err_tx: Sender<PoolError>,
    err_rx: Receiver<PoolError>,
    live: AtomicUsize,
    blocked: AtomicUsize,
    worker_seq: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to a worker pool. Cloning is cheap; all clones drive the
/// same workers and the same error channel.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Spawns the configured core workers and returns the pool handle.
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = unbounded();
        let (err_tx, err_rx) = unbounded();
        let inner = Arc::new(PoolInner {
            name: config.name,
            target: config.threads,
            max_extra: config.max_extra,
            tx: Mutex::new(Some(tx)),
            rx,
            err_tx,
            err_rx,
            live: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            worker_seq: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        });
        for _ in 0..config.threads {
            spawn_worker(&inner, false);
        }
        Self { inner }
    }

    /// Name this pool was configured with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of core worker threads.
    pub fn thread_count(&self) -> usize {
        self.inner.target
    }

    /// Enqueues a task for execution on some worker thread.
    ///
    /// The task runs under `catch_unwind`; a panicking task is reported on
    /// the error channel and never takes its worker down.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PoolClosed> {
        let guard = self.inner.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                // Send on an unbounded channel only fails once every sender
                // is gone, which `guard` rules out here.
                let _ = tx.send(Box::new(task));
                Ok(())
            }
            None => Err(PoolClosed {
                pool: self.inner.name.clone(),
            }),
        }
    }

    /// Marks the current thread as parked for the duration of the guard.
    ///
    /// While the number of unparked live workers is zero the pool spawns an
    /// ephemeral replacement (bounded by `max_extra`) so queued tasks keep
    /// draining. Safe to call from non-worker threads; it still maintains the
    /// counters but only grows pools the thread belongs to.
    pub fn blocking_section(&self) -> BlockingGuard {
        enter_blocking(Arc::clone(&self.inner))
    }

    /// Reports a failure through the pool's error channel.
    pub fn report(&self, origin: impl Into<String>, message: impl Into<String>) {
        let report = PoolError {
            pool: self.inner.name.clone(),
            origin: origin.into(),
            message: message.into(),
        };
        error!(
            "pool `{}`: task `{}` failed: {}",
            report.pool, report.origin, report.message
        );
        let _ = self.inner.err_tx.send(report);
    }

    /// Drains all failure reports accumulated so far.
    pub fn take_errors(&self) -> Vec<PoolError> {
        self.inner.err_rx.try_iter().collect()
    }

    /// Returns a receiver observing failure reports as they arrive.
    pub fn error_receiver(&self) -> Receiver<PoolError> {
        self.inner.err_rx.clone()
    }

    /// Closes the task queue, drains in-flight work and joins every worker.
    ///
    /// Subsequent [`spawn`](Self::spawn) calls fail with [`PoolClosed`].
    /// Calling `shutdown` from a worker thread of the same pool is not
    /// supported (a worker cannot join itself).
    pub fn shutdown(&self) {
        let sender = self.inner.tx.lock().take();
        drop(sender);
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("pool `{}` shut down", self.inner.name);
    }
}

/// Scope marking the current thread as parked on a blocking wait.
pub struct BlockingGuard {
    inner: Arc<PoolInner>,
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        self.inner.blocked.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Enters a blocking section for the pool owning the current worker thread.
///
/// Returns `None` when the current thread is not a pool worker; callers on
/// client threads park without affecting any pool's capacity accounting.
pub fn blocking_section_if_worker() -> Option<BlockingGuard> {
    CURRENT_POOL.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(enter_blocking)
    })
}

/// Extracts a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn enter_blocking(inner: Arc<PoolInner>) -> BlockingGuard {
    let blocked = inner.blocked.fetch_add(1, Ordering::SeqCst) + 1;
    let live = inner.live.load(Ordering::SeqCst);
    if live <= blocked && live < inner.target + inner.max_extra {
        spawn_worker(&inner, true);
    }
    BlockingGuard { inner }
}

fn spawn_worker(inner: &Arc<PoolInner>, ephemeral: bool) {
    let seq = inner.worker_seq.fetch_add(1, Ordering::Relaxed);
    let thread_name = format!("{}-{}", inner.name, seq);
    inner.live.fetch_add(1, Ordering::SeqCst);
    let worker_inner = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || worker_loop(worker_inner, ephemeral));
    match spawned {
        Ok(handle) => {
            if !ephemeral {
                inner.handles.lock().push(handle);
            }
        }
        Err(err) => {
            inner.live.fetch_sub(1, Ordering::SeqCst);
            error!("pool `{}`: failed to spawn `{thread_name}`: {err}", inner.name);
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, ephemeral: bool) {
    CURRENT_POOL.with(|cell| {
        *cell.borrow_mut() = Some(Arc::downgrade(&inner));
    });
    if ephemeral {
        debug!("pool `{}`: replacement worker online", inner.name);
    }
    loop {
        match inner.rx.recv_timeout(EPHEMERAL_IDLE_POLL) {
            Ok(task) => run_task(&inner, task),
            Err(RecvTimeoutError::Timeout) => {
                // Replacement workers retire once some core worker is
                // unparked again; core workers wait out the lull.
                if ephemeral && inner.blocked.load(Ordering::SeqCst) == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
    if ephemeral {
        debug!("pool `{}`: replacement worker retired", inner.name);
    }
}

fn run_task(inner: &Arc<PoolInner>, task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        let message = panic_message(payload.as_ref());
        let report = PoolError {
            pool: inner.name.clone(),
            origin: thread::current()
                .name()
                .unwrap_or("worker")
                .to_string(),
            message,
        };
        error!(
            "pool `{}`: task panicked on `{}`: {}",
            report.pool, report.origin, report.message
        );
        let _ = inner.err_tx.send(report);
    }
}
