use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::control::{ControlError, ControlManager};
use crate::delivery::{BroadcastTransport, DeliveryServer};
use crate::geo::MaxMindLocator;
use crate::metrics::Metrics;
use crate::pipeline::event::LocalObserver;
use crate::pipeline::{queue, Classifier, Dispatcher, Listener, SnapshotCollector};
use crate::relay::Enricher;
use crate::traffic::TrafficSampler;

/// How long `stop` waits for background tasks before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Agent owns the control session and wires the pipeline together:
/// subscription loop, dispatcher and delivery server.
pub struct Agent {
    cfg: Config,
    metrics: Arc<Metrics>,
    control: Arc<ControlManager>,
    transport: Arc<BroadcastTransport>,
    server: Option<DeliveryServer<ControlManager, MaxMindLocator>>,
    tasks: Vec<JoinHandle<()>>,
    fatal: Option<oneshot::Receiver<ControlError>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Create a new agent from configuration.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new().context("creating metrics")?);
        let control = Arc::new(ControlManager::new(
            cfg.control.clone(),
            Arc::clone(&metrics),
        ));
        let transport = Arc::new(BroadcastTransport::new(cfg.server.broadcast_capacity));

        Ok(Self {
            cfg,
            metrics,
            control,
            transport,
            server: None,
            tasks: Vec::new(),
            fatal: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Geolocation database.
        let geo = Arc::new(
            MaxMindLocator::open(&self.cfg.geoip.database)
                .context("opening geolocation database")?,
        );

        let enricher = Enricher::new(
            Arc::clone(&self.control),
            geo,
            Arc::clone(&self.metrics),
        );
        let snapshots = SnapshotCollector::new(enricher.clone(), Arc::clone(&self.metrics));

        // 2. Dispatcher, the single consumer of the delivery queue.
        let (queue_tx, queue_rx) = queue::channel(Arc::clone(&self.metrics));

        let dispatcher = Dispatcher::new(
            queue_rx,
            snapshots.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.metrics),
        );
        self.tasks
            .push(tokio::spawn(dispatcher.run(self.cancel.child_token())));

        // 3. Subscription loop. Authentication failure ends it and is
        // reported through `take_fatal`.
        let events = self
            .control
            .take_events()
            .context("control notification feed already taken")?;

        let observer = self.cfg.observer.as_ref().map(LocalObserver::from);
        let classifier = Classifier::new(enricher, queue_tx, observer, Arc::clone(&self.metrics));
        let listener = Listener::new(
            Arc::clone(&self.control),
            classifier,
            self.cfg.control.reconnect_interval,
            Arc::clone(&self.metrics),
        );

        let (fatal_tx, fatal_rx) = oneshot::channel();
        self.fatal = Some(fatal_rx);

        let cancel = self.cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(events, cancel).await {
                let _ = fatal_tx.send(e);
            }
        }));

        // 4. Delivery server.
        let traffic = self
            .cfg
            .traffic
            .enabled
            .then(|| TrafficSampler::new(Arc::clone(&self.control)));

        let server = DeliveryServer::new(
            &self.cfg.server.addr,
            self.cfg.server.keep_alive,
            snapshots,
            Arc::clone(&self.transport),
            traffic,
            Arc::clone(&self.metrics),
        );
        server.start().await.context("starting delivery server")?;
        self.server = Some(server);

        info!(
            control = %self.cfg.control.address,
            server = %self.cfg.server.addr,
            observer = self.cfg.observer.is_some(),
            "agent fully started",
        );

        Ok(())
    }

    /// Resolves with the cause if the pipeline hits an unrecoverable error.
    /// Available once after `start`.
    pub fn take_fatal(&mut self) -> Option<oneshot::Receiver<ControlError>> {
        self.fatal.take()
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(server) = &self.server {
            server.stop();
        }

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "background task failed"),
                Err(_) => warn!("background task did not stop in time"),
            }
        }

        self.control.close().await;

        info!("agent stopped");

        Ok(())
    }
}
