use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use super::event::TelemetryEvent;
use crate::metrics::Metrics;

/// The dispatcher has gone away and the event could not be queued.
#[derive(Error, Debug)]
#[error("delivery queue closed")]
pub struct QueueClosed(pub TelemetryEvent);

/// Create the delivery queue.
///
/// The queue is unbounded: producers never wait on the dispatcher and no
/// event is ever dropped for lack of room. Depth is exported as a gauge.
pub fn channel(metrics: Arc<Metrics>) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();

    (
        QueueSender {
            tx,
            metrics: Arc::clone(&metrics),
        },
        QueueReceiver { rx, metrics },
    )
}

/// Producer half. Cheap to clone.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
    metrics: Arc<Metrics>,
}

impl QueueSender {
    /// Enqueue without waiting.
    pub fn push(&self, event: TelemetryEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).map_err(|e| QueueClosed(e.0))?;
        self.metrics.queue_depth.inc();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the dispatcher.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    metrics: Arc<Metrics>,
}

impl QueueReceiver {
    /// Next event in arrival order; `None` once every sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        let event = self.rx.recv().await?;
        self.metrics.queue_depth.dec();
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
