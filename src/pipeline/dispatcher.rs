use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{Payload, TelemetryEvent};
use super::queue::QueueReceiver;
use super::snapshot::SnapshotCollector;
use crate::control::ControlPort;
use crate::delivery::Transport;
use crate::geo::GeoLocator;
use crate::metrics::Metrics;

/// Single consumer of the delivery queue.
///
/// Events are handled strictly in arrival order. Stream telemetry is
/// forwarded as is; a built circuit is replaced by a fresh snapshot of the
/// whole node set.
pub struct Dispatcher<C, G, T> {
    queue: QueueReceiver,
    snapshots: SnapshotCollector<C, G>,
    transport: Arc<T>,
    metrics: Arc<Metrics>,
}

impl<C: ControlPort, G: GeoLocator, T: Transport> Dispatcher<C, G, T> {
    pub fn new(
        queue: QueueReceiver,
        snapshots: SnapshotCollector<C, G>,
        transport: Arc<T>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            snapshots,
            transport,
            metrics,
        }
    }

    /// Run until cancelled or until every producer is gone and the queue is
    /// drained.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(pending = self.queue.len(), "dispatcher cancelled");
                    return;
                }
                event = self.queue.recv() => {
                    let Some(event) = event else {
                        info!("delivery queue closed, dispatcher stopping");
                        return;
                    };
                    self.dispatch(event).await;
                }
            }
        }
    }

    /// Deliver one event.
    pub async fn dispatch(&self, event: TelemetryEvent) {
        let payload = match event {
            TelemetryEvent::Stream(stream) => Payload::from_stream(&stream),
            TelemetryEvent::Circuit(circuit) => match self.snapshots.snapshot().await {
                Ok(nodes) => {
                    debug!(
                        circuit_id = %circuit.circuit_id,
                        nodes = nodes.len(),
                        "publishing snapshot for built circuit",
                    );
                    Payload::snapshot(&nodes)
                }
                Err(e) => {
                    warn!(
                        circuit_id = %circuit.circuit_id,
                        error = %e,
                        "snapshot failed, skipping delivery",
                    );
                    return;
                }
            },
        };

        self.metrics
            .payloads_published
            .with_label_values(&[payload.status()])
            .inc();
        self.transport.publish(payload);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::event::{CircuitTelemetry, StreamTelemetry};
    use crate::pipeline::queue;
    use crate::relay::Enricher;
    use crate::testing::{circuit, FakeControl, MemoryGeo, RecordingTransport};

    fn stream_event(id: usize) -> TelemetryEvent {
        TelemetryEvent::Stream(StreamTelemetry {
            stream_id: id.to_string(),
            target: format!("192.0.2.{id}:80"),
            target_location: None,
            target_country: None,
            circuit_id: "1".to_string(),
            path: Vec::new(),
            observer: None,
        })
    }

    fn circuit_event(id: &str) -> TelemetryEvent {
        TelemetryEvent::Circuit(CircuitTelemetry {
            circuit_id: id.to_string(),
            path: Vec::new(),
        })
    }

    fn collector(control: Arc<FakeControl>, metrics: &Arc<Metrics>) -> SnapshotCollector<FakeControl, MemoryGeo> {
        let enricher = Enricher::new(control, Arc::new(MemoryGeo::new()), Arc::clone(metrics));
        SnapshotCollector::new(enricher, Arc::clone(metrics))
    }

    #[tokio::test]
    async fn test_run_drains_in_order_then_stops() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let control = Arc::new(FakeControl::new());
        let transport = Arc::new(RecordingTransport::new());
        let (tx, rx) = queue::channel(Arc::clone(&metrics));

        for i in 0..20 {
            tx.push(stream_event(i)).unwrap();
        }
        drop(tx);

        Dispatcher::new(rx, collector(control, &metrics), Arc::clone(&transport), metrics)
            .run(CancellationToken::new())
            .await;

        let targets: Vec<String> = transport
            .published()
            .into_iter()
            .map(|p| match p {
                Payload::StreamSucceeded { stream_target, .. } => stream_target,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("192.0.2.{i}:80")).collect();
        assert_eq!(targets, expected);
    }

    #[tokio::test]
    async fn test_circuit_event_publishes_snapshot() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let control = Arc::new(FakeControl::new());
        control.add_relay("AAAA", "a", "198.51.100.1", None);
        control.set_circuits(vec![circuit("1", &[("AAAA", "a")])]);
        let transport = Arc::new(RecordingTransport::new());
        let (_tx, rx) = queue::channel(Arc::clone(&metrics));

        let dispatcher = Dispatcher::new(
            rx,
            collector(Arc::clone(&control), &metrics),
            Arc::clone(&transport),
            Arc::clone(&metrics),
        );
        dispatcher.dispatch(circuit_event("1")).await;

        let published = transport.published();
        assert_eq!(published.len(), 1);
        let Payload::CircuitBuilt { data } = &published[0] else {
            panic!("expected snapshot payload");
        };
        assert_eq!(data.len(), 1);
        assert_eq!(control.circuit_queries(), 1);
        assert_eq!(metrics.snapshots_taken.get(), 1.0);
    }

    #[tokio::test]
    async fn test_failed_snapshot_publishes_nothing() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let control = Arc::new(FakeControl::new());
        control.fail_circuits(true);
        let transport = Arc::new(RecordingTransport::new());
        let (_tx, rx) = queue::channel(Arc::clone(&metrics));

        Dispatcher::new(rx, collector(control, &metrics), Arc::clone(&transport), metrics)
            .dispatch(circuit_event("1"))
            .await;

        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let transport = Arc::new(RecordingTransport::new());
        let (_tx, rx) = queue::channel(Arc::clone(&metrics));
        let cancel = CancellationToken::new();
        cancel.cancel();

        Dispatcher::new(
            rx,
            collector(Arc::new(FakeControl::new()), &metrics),
            transport,
            metrics,
        )
        .run(cancel)
        .await;
    }
}
