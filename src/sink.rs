use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::Signal;

/// Where qualifying signals go. Delivery problems are the sink's own concern.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn emit(&self, signal: Signal);
}

/// Forwards signals to the in-process consumer (logging + persistence).
pub struct ChannelSink {
    tx: mpsc::Sender<Signal>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Signal>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SignalSink for ChannelSink {
    async fn emit(&self, signal: Signal) {
        let key = signal.dedup_key.clone();
        if self.tx.send(signal).await.is_err() {
            warn!(dedup_key = %key, "[SIGNAL] consumer gone, signal dropped");
        }
    }
}
