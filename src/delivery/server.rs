use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Gauge;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BroadcastTransport, Published};
use crate::control::ControlPort;
use crate::geo::GeoLocator;
use crate::metrics::Metrics;
use crate::pipeline::event::{MapNode, Payload};
use crate::pipeline::SnapshotCollector;
use crate::traffic::TrafficSampler;

/// Payloads queued per subscriber connection between the fan-out and the
/// socket.
const SUBSCRIBER_BUFFER: usize = 64;

/// HTTP surface for live viewers.
///
/// - `GET /events`: server-sent events. A fresh node-set snapshot first, then
///   every published payload, each named after its `status`.
/// - `GET /nodes`: the current node-set snapshot.
/// - `GET /traffic`: relay throughput since the previous call.
/// - `GET /metrics`, `GET /healthz`.
pub struct DeliveryServer<C, G> {
    addr: String,
    state: Arc<AppState<C, G>>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

struct AppState<C, G> {
    snapshots: SnapshotCollector<C, G>,
    transport: Arc<BroadcastTransport>,
    traffic: Option<TrafficSampler<C>>,
    metrics: Arc<Metrics>,
    keep_alive: Duration,
}

impl<C: ControlPort, G: GeoLocator> DeliveryServer<C, G> {
    pub fn new(
        addr: &str,
        keep_alive: Duration,
        snapshots: SnapshotCollector<C, G>,
        transport: Arc<BroadcastTransport>,
        traffic: Option<TrafficSampler<C>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState {
                snapshots,
                transport,
                traffic,
                metrics,
                keep_alive,
            }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let mut app = Router::new()
            .route("/events", get(events_handler::<C, G>))
            .route("/nodes", get(nodes_handler::<C, G>))
            .route("/metrics", get(metrics_handler::<C, G>))
            .route("/healthz", get(healthz_handler));

        if self.state.traffic.is_some() {
            app = app.route("/traffic", get(traffic_handler::<C, G>));
        }

        let app = app.with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "delivery server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "delivery server error");
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting connections and close open streams.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /events - snapshot, then live payloads.
async fn events_handler<C: ControlPort, G: GeoLocator>(
    State(state): State<Arc<AppState<C, G>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let attached = Attached::new(state.metrics.subscribers_connected.clone());

    // Subscribe before snapshotting so nothing published meanwhile is missed.
    let live = state.transport.subscribe();
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    tokio::spawn(forward(state.snapshots.clone(), live, tx, attached));

    let stream = ReceiverStream::new(rx).map(|published: Published| {
        Ok::<_, Infallible>(
            Event::default()
                .event(published.status)
                .data(&*published.json),
        )
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive))
}

/// Counts one attached subscriber for as long as it lives.
struct Attached(Gauge);

impl Attached {
    fn new(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        self.0.dec();
    }
}

async fn forward<C: ControlPort, G: GeoLocator>(
    snapshots: SnapshotCollector<C, G>,
    mut live: broadcast::Receiver<Published>,
    tx: mpsc::Sender<Published>,
    _attached: Attached,
) {
    match snapshots.snapshot().await {
        Ok(nodes) => match Published::encode(&Payload::snapshot(&nodes)) {
            Ok(initial) => {
                if tx.send(initial).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "failed to encode initial snapshot"),
        },
        Err(e) => warn!(error = %e, "initial snapshot for subscriber failed"),
    }

    loop {
        // A disconnected client closes the channel; don't wait for the next
        // publish to notice.
        let received = tokio::select! {
            _ = tx.closed() => break,
            received = live.recv() => received,
        };

        match received {
            Ok(published) => {
                if tx.send(published).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber lagging, payloads skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("subscriber disconnected");
}

/// GET /nodes - pull refresh of the node set.
async fn nodes_handler<C: ControlPort, G: GeoLocator>(
    State(state): State<Arc<AppState<C, G>>>,
) -> Response {
    match state.snapshots.snapshot().await {
        Ok(nodes) => Json(nodes.iter().map(MapNode::from).collect::<Vec<_>>()).into_response(),
        Err(e) => {
            warn!(error = %e, "snapshot request failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// GET /traffic - throughput sample.
async fn traffic_handler<C: ControlPort, G: GeoLocator>(
    State(state): State<Arc<AppState<C, G>>>,
) -> Response {
    let Some(sampler) = &state.traffic else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match sampler.sample().await {
        Ok(sample) => Json(sample).into_response(),
        Err(e) => {
            warn!(error = %e, "traffic sample failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler<C: ControlPort, G: GeoLocator>(
    State(state): State<Arc<AppState<C, G>>>,
) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
