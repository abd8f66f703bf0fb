use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Bounded multi-producer, multi-consumer queue. Producers wait when it is full.
pub fn work_queue<T>(capacity: usize) -> (WorkQueueSender<T>, WorkQueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        WorkQueueSender { tx },
        WorkQueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

pub struct WorkQueueSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for WorkQueueSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> WorkQueueSender<T> {
    /// Wait for room, then enqueue. Fails on cancellation or once every consumer is gone.
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| AppError::ChannelSend("work queue closed".to_string())),
        }
    }

    /// Items currently waiting.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Each item is delivered to exactly one of the cloned receivers.
pub struct WorkQueueReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for WorkQueueReceiver<T> {
    fn clone(&self) -> Self {
        Self { rx: Arc::clone(&self.rx) }
    }
}

impl<T> WorkQueueReceiver<T> {
    /// `None` on cancellation or once all senders are dropped and the queue is drained.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            item = async { self.rx.lock().await.recv().await } => item,
        }
    }
}
