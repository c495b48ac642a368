//! Per-session FIFO executor, plus cross-queue atomic acquisition for
//! multi-key transactional work.
//!
//! A [`SerialQueue`] runs queued async closures strictly one at a time, in
//! submission order, on a dedicated drain task. [`multi_add`] acquires a
//! simultaneous head-of-queue position on several queues at once so a
//! closure can run with mutual exclusion across all of them.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use latchkv_core::error::StoreError;
use tokio::sync::{broadcast, mpsc, oneshot, Barrier};
use tokio::task::JoinHandle;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct QueueItem {
    cancelled: Arc<AtomicBool>,
    run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

/// A FIFO queue of async operations, executed one at a time on a dedicated
/// drain task.
pub struct SerialQueue {
    sender: mpsc::UnboundedSender<QueueItem>,
    drain: JoinHandle<()>,
}

impl SerialQueue {
    /// Creates a new, empty queue and spawns its drain task.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let drain = tokio::spawn(Self::drain_loop(receiver));
        Self { sender, drain }
    }

    async fn drain_loop(mut receiver: mpsc::UnboundedReceiver<QueueItem>) {
        while let Some(item) = receiver.recv().await {
            if item.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            (item.run)().await;
        }
    }

    /// Enqueues `f`, bounded by `timeout`. Returns a future that resolves
    /// once `f` has run (or the item was cancelled, timed out, or the
    /// queue was dropped).
    pub fn add<T, F>(&self, timeout: Duration, f: impl FnOnce() -> F + Send + 'static) -> QueueFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        self.enqueue(Some(timeout), f)
    }

    /// Enqueues `f` with no timeout. Used internally by [`multi_add`] for
    /// "block" items, whose lifetime is governed by the coordinated
    /// region's own work, not the queue's per-item timeout.
    pub(crate) fn add_untimed<T, F>(&self, f: impl FnOnce() -> F + Send + 'static) -> QueueFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        self.enqueue(None, f)
    }

    fn enqueue<T, F>(&self, timeout: Option<Duration>, f: impl FnOnce() -> F + Send + 'static) -> QueueFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send> = Box::new(move || {
            Box::pin(async move {
                let result = match timeout {
                    Some(d) => match tokio::time::timeout(d, f()).await {
                        Ok(r) => r,
                        Err(_) => Err(StoreError::BackendTransient(anyhow::anyhow!(
                            "queued operation timed out after {d:?}"
                        ))),
                    },
                    None => f().await,
                };
                let _ = tx.send(result);
            })
        });

        // A dropped receiver on a live queue just means the caller stopped
        // caring about the result; the queue keeps draining regardless.
        let _ = self.sender.send(QueueItem { cancelled: cancelled.clone(), run });

        QueueFuture { receiver: Some(rx), cancelled }
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

/// The future returned by [`SerialQueue::add`].
///
/// Dropping this future before it resolves cancels the queued item if it
/// has not yet been dequeued; cancellation while the item is executing has
/// no effect (the item has already been removed from the queue and is
/// running to completion).
pub struct QueueFuture<T> {
    receiver: Option<oneshot::Receiver<Result<T, StoreError>>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> Future for QueueFuture<T> {
    type Output = Result<T, StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        use std::task::Poll;
        let receiver = self.receiver.as_mut().expect("polled after completion");
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::BackendFatal(anyhow::anyhow!(
                "queue was dropped before the operation ran"
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for QueueFuture<T> {
    fn drop(&mut self) {
        // Only marks cancellation; if the drain loop already dequeued the
        // item, this flag is checked too late and has no effect, matching
        // "cancellation while executing has no effect".
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Acquires a simultaneous head-of-queue position on every queue in
/// `queues`, then runs `f` with mutual exclusion across all of them.
/// Whether `f` succeeds or fails, every queue's head-of-queue slot is
/// released before this function returns.
///
/// Ordering across queues is unspecified; the only guarantee is mutual
/// exclusion on all `n` queues for the duration of `f`.
pub async fn multi_add<T, F>(queues: &[&SerialQueue], f: impl FnOnce() -> F + Send + 'static) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    let n = queues.len();
    if n == 0 {
        return f().await;
    }

    // The coordinator is itself a barrier participant (n + 1 parties), so
    // its `wait()` below cannot complete -- and `f` cannot start -- until
    // every block has already reached the barrier. Unlike a `Notify`, a
    // `Barrier` counts arrivals rather than delivering a one-shot wakeup,
    // so there's no window where a leader's release fires before the
    // coordinator starts listening for it.
    let barrier = Arc::new(Barrier::new(n + 1));
    let (release_tx, _) = broadcast::channel::<()>(1);

    let mut blocks = Vec::with_capacity(n);
    for queue in queues {
        let barrier = barrier.clone();
        let mut release_rx = release_tx.subscribe();
        let block: QueueFuture<()> = queue.add_untimed(move || async move {
            barrier.wait().await;
            let _ = release_rx.recv().await;
            Ok(())
        });
        blocks.push(block);
    }

    barrier.wait().await;
    let result = f().await;
    let _ = release_tx.send(());

    for block in blocks {
        let _ = block.await;
    }

    result
}
