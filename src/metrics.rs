use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "circuitmap";

/// Prometheus metrics for the telemetry pipeline.
///
/// All metrics use the "circuitmap" namespace and are registered on a
/// private registry, so several instances can coexist in one process.
pub struct Metrics {
    registry: Registry,

    // === Control channel ===
    /// Control requests by outcome (ok, or an error label).
    pub control_requests: CounterVec,
    /// Sessions opened after the first one.
    pub control_reconnects: Counter,
    /// Whether a live, authenticated session exists (1=yes, 0=no).
    pub control_connected: Gauge,

    // === Classification ===
    /// Notifications received from the subscription feed by kind.
    pub events_received: CounterVec,
    /// Notifications dropped before reaching the queue, by reason.
    pub events_dropped: CounterVec,
    /// Single-field enrichment failures by field.
    pub enrichment_failures: CounterVec,

    // === Delivery ===
    /// Telemetry events currently waiting for the dispatcher.
    pub queue_depth: Gauge,
    /// Payloads handed to the transport by status.
    pub payloads_published: CounterVec,
    /// Subscribers currently attached to the live event stream.
    pub subscribers_connected: Gauge,

    // === Snapshots ===
    /// Full node-set snapshots taken.
    pub snapshots_taken: Counter,
    /// Snapshot collection latency (10ms-10s buckets).
    pub snapshot_duration: Histogram,
    /// Nodes in the most recent snapshot.
    pub snapshot_nodes: Gauge,
}

impl Metrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let control_requests = CounterVec::new(
            Opts::new(
                "control_requests_total",
                "Control requests by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let control_reconnects = Counter::with_opts(
            Opts::new(
                "control_reconnects_total",
                "Control sessions opened after the initial one.",
            )
            .namespace(NAMESPACE),
        )?;
        let control_connected = Gauge::with_opts(
            Opts::new(
                "control_connected",
                "Whether an authenticated control session exists (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Notifications received from the control port by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let events_dropped = CounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Notifications dropped before queueing, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let enrichment_failures = CounterVec::new(
            Opts::new(
                "enrichment_failures_total",
                "Relay fields that could not be resolved, by field.",
            )
            .namespace(NAMESPACE),
            &["field"],
        )?;

        let queue_depth = Gauge::with_opts(
            Opts::new(
                "queue_depth",
                "Telemetry events waiting for the dispatcher.",
            )
            .namespace(NAMESPACE),
        )?;
        let payloads_published = CounterVec::new(
            Opts::new(
                "payloads_published_total",
                "Payloads handed to the delivery transport by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let subscribers_connected = Gauge::with_opts(
            Opts::new(
                "subscribers_connected",
                "Subscribers currently attached to the live event stream.",
            )
            .namespace(NAMESPACE),
        )?;

        let snapshots_taken = Counter::with_opts(
            Opts::new("snapshots_total", "Full node-set snapshots taken.").namespace(NAMESPACE),
        )?;
        let snapshot_duration = Histogram::with_opts(
            HistogramOpts::new(
                "snapshot_duration_seconds",
                "Time to collect and enrich a full node-set snapshot.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let snapshot_nodes = Gauge::with_opts(
            Opts::new("snapshot_nodes", "Nodes in the most recent snapshot.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(control_requests.clone()))?;
        registry.register(Box::new(control_reconnects.clone()))?;
        registry.register(Box::new(control_connected.clone()))?;
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(enrichment_failures.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(payloads_published.clone()))?;
        registry.register(Box::new(subscribers_connected.clone()))?;
        registry.register(Box::new(snapshots_taken.clone()))?;
        registry.register(Box::new(snapshot_duration.clone()))?;
        registry.register(Box::new(snapshot_nodes.clone()))?;

        Ok(Self {
            registry,
            control_requests,
            control_reconnects,
            control_connected,
            events_received,
            events_dropped,
            enrichment_failures,
            queue_depth,
            payloads_published,
            subscribers_connected,
            snapshots_taken,
            snapshot_duration,
            snapshot_nodes,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}
