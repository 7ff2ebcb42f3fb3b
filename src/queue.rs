//! Cancellable FIFO hand-off between a producer and asynchronous consumers.
//!
//! The replication listener enqueues decoded transactions while the sync
//! controller dequeues them at its own pace. `enqueue` never blocks; an
//! optional capacity is exposed through [`AsyncQueue::ready`], which
//! producers await before enqueueing.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Returned by every pending and future `dequeue` once the queue is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue aborted")]
pub struct QueueAborted;

struct QueueState<T> {
    items: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

pub struct AsyncQueue<T> {
    state: Mutex<QueueState<T>>,
    cancel: CancellationToken,
    capacity: Option<usize>,
    space: Notify,
}

impl<T> AsyncQueue<T> {
    /// Creates an unbounded queue aborted by `cancel`.
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_capacity(None, cancel)
    }

    /// Creates a queue whose [`ready`](Self::ready) signal holds producers
    /// back while `capacity` items are waiting.
    pub fn bounded(capacity: usize, cancel: CancellationToken) -> Self {
        Self::with_capacity(Some(capacity.max(1)), cancel)
    }

    fn with_capacity(capacity: Option<usize>, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            cancel,
            capacity,
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands `item` to the longest-waiting consumer, or stores it.
    ///
    /// Items enqueued after the queue was aborted are dropped.
    pub fn enqueue(&self, item: T) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut state = self.lock();
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                // That consumer went away; try the next one.
                Err(returned) => item = returned,
            }
        }
        state.items.push_back(item);
    }

    /// Removes the oldest item, waiting for one if the queue is empty.
    ///
    /// Concurrent callers are served in call order. Not cancel safe: an item
    /// handed to a dropped `dequeue` future is lost.
    pub async fn dequeue(&self) -> Result<T, QueueAborted> {
        if self.cancel.is_cancelled() {
            return Err(QueueAborted);
        }

        let mut rx = {
            let mut state = self.lock();
            if let Some(item) = state.items.pop_front() {
                self.space.notify_one();
                return Ok(item);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        tokio::select! {
            biased;
            item = &mut rx => item.map_err(|_| QueueAborted),
            _ = self.cancel.cancelled() => Err(QueueAborted),
        }
    }

    /// Resolves once the queue holds fewer items than its capacity.
    pub async fn ready(&self) -> Result<(), QueueAborted> {
        let Some(capacity) = self.capacity else {
            return if self.cancel.is_cancelled() {
                Err(QueueAborted)
            } else {
                Ok(())
            };
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(QueueAborted);
            }
            let notified = self.space.notified();
            if self.len() < capacity {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return Err(QueueAborted),
            }
        }
    }

    /// Fails every pending and future `dequeue`.
    pub fn abort(&self) {
        self.cancel.cancel();
        let mut state = self.lock();
        state.waiters.clear();
        state.items.clear();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = AsyncQueue::new(CancellationToken::new());
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);

        assert_eq!(queue.dequeue().await, Ok(1));
        assert_eq!(queue.dequeue().await, Ok(2));
        assert_eq!(queue.dequeue().await, Ok(3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(AsyncQueue::new(CancellationToken::new()));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("hello");

        let item = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(item, Ok("hello"));
    }

    #[tokio::test]
    async fn test_waiters_served_in_call_order() {
        let queue = AsyncQueue::new(CancellationToken::new());
        let mut first = Box::pin(queue.dequeue());
        let mut second = Box::pin(queue.dequeue());
        let mut third = Box::pin(queue.dequeue());
        assert!(futures::poll!(&mut first).is_pending());
        assert!(futures::poll!(&mut second).is_pending());
        assert!(futures::poll!(&mut third).is_pending());

        queue.enqueue('a');
        queue.enqueue('b');
        queue.enqueue('c');

        assert_eq!(first.await, Ok('a'));
        assert_eq!(second.await, Ok('b'));
        assert_eq!(third.await, Ok('c'));
    }

    #[tokio::test]
    async fn test_cancellation_fails_pending_and_future_dequeues() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(AsyncQueue::<u32>::new(cancel.clone()));
        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert_eq!(result, Err(QueueAborted));

        queue.enqueue(7);
        assert_eq!(queue.dequeue().await, Err(QueueAborted));
        assert_eq!(queue.dequeue().await, Err(QueueAborted));
    }

    #[tokio::test]
    async fn test_abort_discards_buffered_items() {
        let queue = AsyncQueue::new(CancellationToken::new());
        queue.enqueue(1);
        queue.abort();
        assert!(queue.is_aborted());
        assert_eq!(queue.dequeue().await, Err(QueueAborted));
    }

    #[tokio::test]
    async fn test_ready_waits_for_capacity() {
        let queue = Arc::new(AsyncQueue::bounded(1, CancellationToken::new()));
        queue.ready().await.unwrap();
        queue.enqueue(1);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.dequeue().await, Ok(1));
        let ready = timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!(ready, Ok(()));
    }

    #[tokio::test]
    async fn test_ready_fails_after_abort() {
        let queue = AsyncQueue::bounded(1, CancellationToken::new());
        queue.enqueue(1);
        queue.abort();
        assert_eq!(queue.ready().await, Err(QueueAborted));
    }
}
