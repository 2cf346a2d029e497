use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::control::{ControlError, ControlPort};
use crate::geo::GeoLocator;
use crate::metrics::Metrics;
use crate::relay::{Enricher, RelayRecord};

/// Produces the full current node set on demand.
///
/// Independent of the event stream: the dispatcher calls it on every built
/// circuit, and the delivery server calls it for each new subscriber and
/// each pull refresh. Calls may overlap with event handling.
pub struct SnapshotCollector<C, G> {
    enricher: Enricher<C, G>,
    metrics: Arc<Metrics>,
}

impl<C, G> Clone for SnapshotCollector<C, G> {
    fn clone(&self) -> Self {
        Self {
            enricher: self.enricher.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<C: ControlPort, G: GeoLocator> SnapshotCollector<C, G> {
    pub fn new(enricher: Enricher<C, G>, metrics: Arc<Metrics>) -> Self {
        Self { enricher, metrics }
    }

    pub async fn snapshot(&self) -> Result<Vec<RelayRecord>, ControlError> {
        let started = Instant::now();
        let nodes = self.enricher.collect().await?;
        let elapsed = started.elapsed();

        self.metrics.snapshots_taken.inc();
        self.metrics
            .snapshot_duration
            .observe(elapsed.as_secs_f64());
        self.metrics.snapshot_nodes.set(nodes.len() as f64);

        debug!(nodes = nodes.len(), elapsed = ?elapsed, "snapshot collected");

        Ok(nodes)
    }
}
