use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::classifier::Classifier;
use crate::control::event::{ControlEvent, EventKind};
use crate::control::{ControlError, ControlPort};
use crate::geo::GeoLocator;
use crate::metrics::Metrics;

/// Notification classes the pipeline consumes.
pub const SUBSCRIBED: [EventKind; 2] = [EventKind::Stream, EventKind::Circuit];

/// The subscription loop: waits for notifications and classifies each one
/// inline, in arrival order.
///
/// When the session drops the loop re-subscribes, retrying every
/// `reconnect_interval`. Only an authentication failure ends it with an error.
pub struct Listener<C, G> {
    control: Arc<C>,
    classifier: Classifier<C, G>,
    reconnect_interval: Duration,
    metrics: Arc<Metrics>,
}

impl<C: ControlPort, G: GeoLocator> Listener<C, G> {
    pub fn new(
        control: Arc<C>,
        classifier: Classifier<C, G>,
        reconnect_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            control,
            classifier,
            reconnect_interval,
            metrics,
        }
    }

    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        self.establish(&cancel).await?;

        loop {
            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };

            let Some(event) = event else {
                info!("control notification feed closed");
                return Ok(());
            };

            if matches!(event, ControlEvent::SessionClosed) {
                warn!("control session lost, re-subscribing");
                self.establish(&cancel).await?;
                continue;
            }

            self.metrics
                .events_received
                .with_label_values(&[event.kind()])
                .inc();
            self.classifier.handle(event).await;
        }
    }

    /// Subscribe, retrying until it succeeds, the loop is cancelled, or
    /// authentication is refused.
    async fn establish(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
        loop {
            match self.control.subscribe(&SUBSCRIBED).await {
                Ok(()) => {
                    info!("subscribed to stream and circuit events");
                    return Ok(());
                }
                Err(e @ ControlError::Authentication(_)) => {
                    error!(error = %e, "control port refused authentication");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?self.reconnect_interval,
                        "control port unavailable",
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }
}
