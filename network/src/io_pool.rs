//! # Network I/O Pool
//!
//! The shared worker pool for everything that talks to the network:
//! substrate handshakes, outbound dials, accept loops, per-connection
//! reader loops and per-peer sends during a broadcast.
//!
//! The pool is an explicit object. Whoever builds a node constructs one,
//! hands an `Arc<IoPool>` to every component that needs it, and shuts it
//! down at the end. There is no global.
//!
//! ## Mechanics
//!
//! - Tasks run on the ambient tokio multi-thread runtime.
//! - A semaphore bounds how many short tasks (dials, substrate
//!   handshakes, per-peer sends) may run their body at once; excess tasks
//!   wait for a permit. Callers that need a deadline put it around the
//!   whole [`IoTask`], permit wait included.
//! - Tasks that live as long as their component (accept loops, reader
//!   loops, the expiry sweeper) and coordinators that only wait on other
//!   pool tasks (relays) go through [`IoPool::spawn_unbounded`]. They take
//!   no permit, so idle connections cannot starve the short work and a
//!   coordinator never holds the permit its own sends need.
//! - Every task returns an [`IoTask`] handle: await it for the result, or
//!   cancel it, which drops the future (and whatever half-built session it
//!   was holding).
//! - [`IoPool::shutdown`] refuses new work, waits up to a grace period for
//!   in-flight tasks (queued ones included), then aborts the stragglers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Errors surfaced through [`IoTask`] handles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IoPoolError {
    /// The pool has been shut down and accepts no new work.
    #[error("io pool is shut down")]
    ShutDown,

    /// The task was cancelled before it completed.
    #[error("io task was cancelled")]
    Cancelled,

    /// The task panicked.
    #[error("io task panicked: {0}")]
    Panicked(String),
}

struct PoolState {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    next_id: AtomicU64,
    tasks: DashMap<u64, AbortHandle>,
}

/// Decrements the in-flight counter when a task's future is dropped,
/// whether it completed, was cancelled, or panicked.
struct InFlightGuard {
    state: Arc<PoolState>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.tasks.remove(&self.id);
        if self.state.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// The bounded network I/O pool.
pub struct IoPool {
    name: String,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
    state: Arc<PoolState>,
}

impl std::fmt::Debug for IoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPool")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("in_flight", &self.in_flight())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl IoPool {
    /// Creates a pool that runs at most `max_concurrency` task bodies at once.
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            name: name.into(),
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            state: Arc::new(PoolState {
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                next_id: AtomicU64::new(0),
                tasks: DashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks submitted and not yet finished (running or queued).
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Submits `future` to the pool. Its body runs once a permit is free.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`IoPoolError::ShutDown`] once [`shutdown`](Self::shutdown) began.
    pub fn spawn<F, T>(&self, future: F) -> Result<IoTask<T>, IoPoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(future, true)
    }

    /// Submits a task that starts immediately without a permit: one that
    /// lives as long as its component, or one that only waits on other pool
    /// tasks. It is still tracked, drained and aborted by
    /// [`shutdown`](Self::shutdown).
    pub fn spawn_unbounded<F, T>(&self, future: F) -> Result<IoTask<T>, IoPoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(future, false)
    }

    /// Permits currently free for short tasks.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn submit<F, T>(&self, future: F, bounded: bool) -> Result<IoTask<T>, IoPoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(IoPoolError::ShutDown);
        }

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            state: Arc::clone(&self.state),
            id,
        };
        let permits = bounded.then(|| Arc::clone(&self.permits));

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = match permits {
                Some(permits) => match permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Err(IoPoolError::ShutDown),
                },
                None => None,
            };
            Ok::<T, IoPoolError>(future.await)
        });

        let abort = handle.abort_handle();
        self.state.tasks.insert(id, abort.clone());
        // The task may have finished before we registered it.
        if handle.is_finished() {
            self.state.tasks.remove(&id);
        }

        Ok(IoTask { handle, abort })
    }

    /// Stops accepting work, waits up to `grace` for in-flight tasks, then
    /// aborts whatever is still running. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.name, in_flight = self.in_flight(), "shutting down io pool");

        let state = Arc::clone(&self.state);
        let drained = tokio::time::timeout(grace, async move {
            loop {
                let notified = state.idle.notified();
                if state.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;

        if drained.is_err() {
            let stragglers: Vec<AbortHandle> = self
                .state
                .tasks
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            warn!(
                pool = %self.name,
                count = stragglers.len(),
                "grace period elapsed, aborting in-flight io tasks"
            );
            for abort in stragglers {
                abort.abort();
            }
        }

        debug!(pool = %self.name, "io pool shut down");
    }
}

// ---------------------------------------------------------------------------
// IoTask
// ---------------------------------------------------------------------------

/// Completion handle for a task submitted to the [`IoPool`].
///
/// Dropping the handle does not cancel the task; call
/// [`cancel`](Self::cancel) for that.
pub struct IoTask<T> {
    handle: JoinHandle<Result<T, IoPoolError>>,
    abort: AbortHandle,
}

impl<T> IoTask<T> {
    /// Cancels the task. Its future is dropped at the next yield point.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// A detached handle that can cancel the task from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for IoTask<T> {
    type Output = Result<T, IoPoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(IoPoolError::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(IoPoolError::Panicked(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_task_returns_its_value() {
        let pool = IoPool::new("test", 4);
        let task = pool.spawn(async { 21 * 2 }).unwrap();
        assert_eq!(task.await, Ok(42));
    }

    #[tokio::test]
    async fn cancelled_task_reports_cancellation() {
        let pool = IoPool::new("test", 4);
        let task = pool
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();
        task.cancel();
        assert_eq!(task.await, Err(IoPoolError::Cancelled));
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let pool = IoPool::new("test", 4);
        let task = pool
            .spawn(async {
                let nothing: Option<u8> = None;
                nothing.expect("boom");
            })
            .unwrap();
        let result = task.await;
        assert!(matches!(result, Err(IoPoolError::Panicked(_))));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = IoPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn unbounded_tasks_leave_permits_free() {
        let pool = IoPool::new("test", 1);
        let reader = pool
            .spawn_unbounded(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();
        assert_eq!(pool.available_permits(), 1);

        let send = pool.spawn(async { "sent" }).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), send).await;
        assert!(matches!(result, Ok(Ok("sent"))));

        reader.cancel();
        assert_eq!(reader.await, Err(IoPoolError::Cancelled));
    }

    #[tokio::test]
    async fn unbounded_tasks_are_aborted_on_shutdown() {
        let pool = IoPool::new("test", 1);
        let task = pool
            .spawn_unbounded(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(task.await, Err(IoPoolError::Cancelled));
        assert!(matches!(
            pool.spawn_unbounded(async {}),
            Err(IoPoolError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn spawn_after_shutdown_fails() {
        let pool = IoPool::new("test", 2);
        pool.shutdown(Duration::from_millis(10)).await;
        assert!(pool.is_shut_down());
        assert!(matches!(pool.spawn(async {}), Err(IoPoolError::ShutDown)));
    }

    #[tokio::test]
    async fn shutdown_waits_for_short_tasks() {
        let pool = IoPool::new("test", 2);
        let task = pool
            .spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                "done"
            })
            .unwrap();

        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(task.await, Ok("done"));
    }

    #[tokio::test]
    async fn shutdown_aborts_stragglers_after_grace() {
        let pool = IoPool::new("test", 2);
        let task = pool
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(task.await, Err(IoPoolError::Cancelled));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = IoPool::new("test", 1);
        pool.shutdown(Duration::from_millis(10)).await;
        pool.shutdown(Duration::from_millis(10)).await;
        assert!(pool.is_shut_down());
    }
}
