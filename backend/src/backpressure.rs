//! Bounded adapter-to-normalizer channel with drop-oldest overflow: under
//! sustained backpressure the oldest buffered messages are evicted first —
//! stale drops are preferable to blocking a live feed. A plain `tokio::sync::mpsc` is
//! bounded but drop-*newest* (`try_send` fails on a full channel instead of
//! evicting), so this is a small ring buffer wrapper around a `VecDeque`
//! guarded by a mutex, with a `Notify` waking the single consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct DropOldestSender<T> {
    shared: Arc<Shared<T>>,
}

/// Cloneable: multiple receivers may share one queue, each independently
/// calling `recv`, which is exactly the shape a fixed-size fusion worker
/// pool needs (bounding `maxParallelFusion`) — `Notify::notify_one` wakes at
/// most one waiting receiver per push, so pushes are never duplicated
/// across workers.
#[derive(Clone)]
pub struct DropOldestReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Bounded, drop-oldest MPSC channel of the given capacity (default 10,000
/// between each adapter and the normalizer).
pub fn channel<T>(capacity: usize) -> (DropOldestSender<T>, DropOldestReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
        dropped: AtomicU64::new(0),
    });
    (
        DropOldestSender { shared: shared.clone() },
        DropOldestReceiver { shared },
    )
}

impl<T> DropOldestSender<T> {
    /// Never blocks: pushes onto the back, and if that pushes the queue
    /// over capacity, evicts the front (the oldest message) instead of
    /// applying backpressure to the adapter's connection loop.
    pub async fn send(&self, item: T) {
        let mut queue = self.shared.queue.lock().await;
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(item);
        drop(queue);
        self.shared.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> DropOldestReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut queue = self.shared.queue.lock().await;
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
            }
            // Only this receiver ever waits; senders are never dropped for
            // the lifetime of the process (they're owned by long-running
            // adapter tasks), so there's no "channel closed" signal to
            // propagate here.
            self.shared.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_the_oldest_entry_not_the_newest() {
        let (tx, mut rx) = channel::<i32>(2);
        tx.send(1).await;
        tx.send(2).await;
        tx.send(3).await; // evicts 1

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(tx.dropped_count(), 1);
    }
}
