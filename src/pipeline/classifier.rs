use std::sync::Arc;

use tracing::{debug, warn};

use super::event::{CircuitTelemetry, LocalObserver, StreamTelemetry, TelemetryEvent};
use super::queue::QueueSender;
use crate::control::event::{Circuit, ControlEvent, StreamEvent, StreamStatus};
use crate::control::status;
use crate::control::ControlPort;
use crate::geo::GeoLocator;
use crate::metrics::Metrics;
use crate::relay::Enricher;

/// Why a notification did not produce a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Stream status other than SUCCEEDED.
    StreamStatus,
    /// Circuit status other than BUILT.
    CircuitStatus,
    MissingTarget,
    /// Stream not attached to a circuit.
    MissingCircuit,
    /// The circuit could not be listed.
    CircuitLookup,
    /// The circuit closed before it could be resolved.
    CircuitGone,
    EmptyPath,
    /// Session notifications carry no telemetry.
    NotTelemetry,
    QueueClosed,
}

impl DropReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StreamStatus => "stream_status",
            Self::CircuitStatus => "circuit_status",
            Self::MissingTarget => "missing_target",
            Self::MissingCircuit => "missing_circuit",
            Self::CircuitLookup => "circuit_lookup",
            Self::CircuitGone => "circuit_gone",
            Self::EmptyPath => "empty_path",
            Self::NotTelemetry => "not_telemetry",
            Self::QueueClosed => "queue_closed",
        }
    }
}

/// Result of classifying one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Queued,
    Dropped(DropReason),
}

/// Filters lifecycle notifications down to the states of interest and turns
/// them into [`TelemetryEvent`]s on the delivery queue.
pub struct Classifier<C, G> {
    enricher: Enricher<C, G>,
    queue: QueueSender,
    observer: Option<LocalObserver>,
    metrics: Arc<Metrics>,
}

impl<C: ControlPort, G: GeoLocator> Classifier<C, G> {
    pub fn new(
        enricher: Enricher<C, G>,
        queue: QueueSender,
        observer: Option<LocalObserver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            enricher,
            queue,
            observer,
            metrics,
        }
    }

    /// Classify one notification. Returns once the event is queued or
    /// dropped; never waits on the dispatcher.
    pub async fn handle(&self, event: ControlEvent) -> Classification {
        let result = match event {
            ControlEvent::Stream(stream) => self.classify_stream(stream).await,
            ControlEvent::Circuit(circuit) => self.classify_circuit(circuit),
            ControlEvent::SessionClosed => Err(DropReason::NotTelemetry),
        };

        let telemetry = match result {
            Ok(telemetry) => telemetry,
            Err(reason) => return self.dropped(reason),
        };

        match self.queue.push(telemetry) {
            Ok(()) => Classification::Queued,
            Err(_) => {
                warn!("delivery queue closed, discarding telemetry");
                self.dropped(DropReason::QueueClosed)
            }
        }
    }

    async fn classify_stream(&self, stream: StreamEvent) -> Result<TelemetryEvent, DropReason> {
        if stream.status != StreamStatus::Succeeded {
            return Err(DropReason::StreamStatus);
        }

        let target = stream.target.ok_or(DropReason::MissingTarget)?;
        let circuit_id = stream.circuit_id.ok_or_else(|| {
            debug!(stream_id = %stream.id, target = %target, "stream has no circuit");
            DropReason::MissingCircuit
        })?;

        let circuit = self.find_circuit(&circuit_id).await?;
        if circuit.path.is_empty() {
            debug!(circuit_id = %circuit_id, "circuit has no path");
            return Err(DropReason::EmptyPath);
        }

        let path = self.enricher.describe_path(&circuit).await;
        let target_address = status::target_address(&target);
        let target_location = self.enricher.locate(target_address);
        let target_country = self.enricher.country(target_address).await;

        Ok(TelemetryEvent::Stream(StreamTelemetry {
            stream_id: stream.id,
            target,
            target_location,
            target_country,
            circuit_id,
            path,
            observer: self.observer.clone(),
        }))
    }

    fn classify_circuit(&self, circuit: Circuit) -> Result<TelemetryEvent, DropReason> {
        if !circuit.is_built() {
            return Err(DropReason::CircuitStatus);
        }

        debug!(circuit_id = %circuit.id, hops = circuit.path.len(), "circuit built");

        Ok(TelemetryEvent::Circuit(CircuitTelemetry {
            circuit_id: circuit.id,
            path: circuit.path,
        }))
    }

    async fn find_circuit(&self, circuit_id: &str) -> Result<Circuit, DropReason> {
        let circuits = self.enricher.control().circuits().await.map_err(|e| {
            warn!(circuit_id, error = %e, "failed to list circuits");
            DropReason::CircuitLookup
        })?;

        circuits
            .into_iter()
            .find(|c| c.id == circuit_id)
            .ok_or_else(|| {
                debug!(circuit_id, "circuit no longer exists");
                DropReason::CircuitGone
            })
    }

    fn dropped(&self, reason: DropReason) -> Classification {
        self.metrics
            .events_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
        Classification::Dropped(reason)
    }
}
