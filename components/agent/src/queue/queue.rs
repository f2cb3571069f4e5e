// External crates
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// One flushed batch of lines from a single file, ready for a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub filename: String,
    pub lines: Vec<String>,
    pub fields: Vec<String>,
    /// UTC flush time, `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
    pub timestamp: String,
    /// Encrypter name to apply before the sink, when configured.
    pub encrypter: Option<String>,
}

/// Items carried by the dispatch queue between the tailing worker and the
/// consumer pool.
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// A batch to deliver through the transport.
    Callback(EventBatch),
    /// A glob expansion notice so consumers can update routing state.
    AddGlob { pattern: String, paths: Vec<String> },
    /// Drain-and-terminate sentinel for graceful shutdown.
    Exit,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("dispatch queue is full")]
    Full,
    #[error("dispatch queue is closed")]
    Closed,
}

/// Bounded FIFO connecting the tailing worker to the consumer pool.
///
/// `put` awaits capacity so producers feel backpressure; `try_put` is the
/// best-effort path used for the shutdown sentinel. The receiving side is
/// shared: whichever consumer grabs the lock first takes the next item.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<QueueItem>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    capacity: usize,
}

impl DispatchQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue, waiting for capacity.
    pub async fn put(&self, item: QueueItem) -> Result<(), QueueError> {
        self.tx.send(item).await.map_err(|_| QueueError::Closed)
    }

    /// Enqueue without waiting; fails when the queue is saturated.
    pub fn try_put(&self, item: QueueItem) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Dequeue the next item; `None` once every producer handle is gone
    /// and the queue is drained.
    pub async fn get(&self) -> Option<QueueItem> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(filename: &str) -> EventBatch {
        EventBatch {
            filename: filename.to_string(),
            lines: vec!["line".to_string()],
            fields: Vec::new(),
            timestamp: "2024-01-01T00:00:00.000000Z".to_string(),
            encrypter: None,
        }
    }

    #[tokio::test]
    async fn bounded_try_put_reports_full() {
        let queue = DispatchQueue::bounded(2);
        queue.try_put(QueueItem::Callback(batch("a"))).unwrap();
        queue.try_put(QueueItem::Callback(batch("b"))).unwrap();
        assert!(matches!(queue.try_put(QueueItem::Exit), Err(QueueError::Full)));

        // Draining one slot frees capacity again.
        assert!(queue.get().await.is_some());
        queue.try_put(QueueItem::Exit).unwrap();
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = DispatchQueue::bounded(8);
        for name in ["one", "two", "three"] {
            queue.put(QueueItem::Callback(batch(name))).await.unwrap();
        }
        for expected in ["one", "two", "three"] {
            match queue.get().await {
                Some(QueueItem::Callback(b)) => assert_eq!(b.filename, expected),
                other => panic!("unexpected item: {other:?}"),
            }
        }
    }
}
