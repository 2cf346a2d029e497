use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stem_rs::descriptor::router_status::RouterStatusEntry;
use tokio::sync::{mpsc, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event::{Circuit, ControlEvent, EventKind, TrafficCounters};
use super::session::Session;
use super::status;
use super::{ControlError, ControlPort};
use crate::config::ControlConfig;
use crate::metrics::Metrics;

/// Key queried to tell a rejected command from a dead connection.
const HEALTH_KEY: &str = "version";

/// Owns the single control session and serializes every call on it.
///
/// The session is opened lazily on first use. A connection failure during a
/// call drops the session and the next call opens a fresh one; there is no
/// background retry. Once subscribed, a pump task reads notifications off
/// the same session whenever no call holds it. Notifications from every
/// session generation arrive on one feed, taken once with
/// [`ControlManager::take_events`].
pub struct ControlManager {
    shared: Arc<Shared>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    cfg: ControlConfig,
    session: tokio::sync::Mutex<Option<Session>>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    subscriptions: parking_lot::Mutex<Vec<EventKind>>,
    sessions_opened: AtomicU64,
    /// A caller is queued for the session lock.
    wanted: Notify,
    /// A subscribed session is up.
    subscribed: Notify,
    metrics: Arc<Metrics>,
}

impl ControlManager {
    pub fn new(cfg: ControlConfig, metrics: Arc<Metrics>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                cfg,
                session: tokio::sync::Mutex::new(None),
                events_tx,
                subscriptions: parking_lot::Mutex::new(Vec::new()),
                sessions_opened: AtomicU64::new(0),
                wanted: Notify::new(),
                subscribed: Notify::new(),
                metrics,
            }),
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            pump: parking_lot::Mutex::new(None),
        }
    }

    /// Take the notification feed. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ControlEvent>> {
        self.events_rx.lock().take()
    }

    /// `GETINFO <key>`, returning the value for that key.
    pub async fn request(&self, key: &str) -> Result<String, ControlError> {
        let mut slot = self.shared.lock_session().await;
        let result = self.shared.get_info_locked(&mut slot, key).await;
        self.shared.count(&result);
        result
    }

    /// Whether a session is currently open. Does not connect.
    pub async fn is_connected(&self) -> bool {
        self.shared.lock_session().await.is_some()
    }

    /// Drop the current session, if any.
    pub async fn close(&self) {
        if self.shared.lock_session().await.take().is_some() {
            self.shared.metrics.control_connected.set(0.0);
            debug!("control session closed");
        }
    }

    fn ensure_pump(&self) {
        let mut pump = self.pump.lock();
        if pump.is_none() {
            *pump = Some(tokio::spawn(pump_events(Arc::clone(&self.shared))));
        }
    }
}

impl Drop for ControlManager {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Shared {
    /// Take the session lock, asking the pump to step aside.
    async fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.wanted.notify_one();
        self.session.lock().await
    }

    async fn get_info_locked(
        &self,
        slot: &mut Option<Session>,
        key: &str,
    ) -> Result<String, ControlError> {
        let session = self.ensure_session(slot).await?;
        let result = session.get_info(key, self.cfg.request_timeout).await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.settle(slot, e).await),
        }
    }

    async fn ensure_session<'a>(
        &self,
        slot: &'a mut Option<Session>,
    ) -> Result<&'a mut Session, ControlError> {
        if slot.is_none() {
            *slot = Some(self.open_session().await?);
        }

        slot.as_mut().ok_or(ControlError::NotConnected)
    }

    async fn open_session(&self) -> Result<Session, ControlError> {
        let address: SocketAddr = self.cfg.address.parse().map_err(|_| {
            ControlError::Unavailable(format!("invalid control address {}", self.cfg.address))
        })?;

        let unavailable = |e| match e {
            ControlError::Rejected(message) => ControlError::Unavailable(message),
            other => other,
        };

        let mut session = Session::open(
            address,
            &self.cfg.password,
            self.cfg.connect_timeout,
            self.cfg.request_timeout,
        )
        .await
        .map_err(unavailable)?;

        let kinds = self.subscriptions.lock().clone();
        if !kinds.is_empty() {
            session
                .set_events(&kinds, self.cfg.request_timeout)
                .await
                .map_err(unavailable)?;
            self.subscribed.notify_one();
        }

        if self.sessions_opened.fetch_add(1, Ordering::Relaxed) > 0 {
            self.metrics.control_reconnects.inc();
        }
        self.metrics.control_connected.set(1.0);

        info!(
            address = %self.cfg.address,
            events = kinds.len(),
            "control session established",
        );

        Ok(session)
    }

    /// Decide what a failed call means for the session. A rejection is only
    /// trusted if the session still answers a health check.
    async fn settle(&self, slot: &mut Option<Session>, err: ControlError) -> ControlError {
        let err = match err {
            ControlError::Rejected(message) => {
                let alive = match slot.as_mut() {
                    Some(session) => session
                        .get_info(HEALTH_KEY, self.cfg.request_timeout)
                        .await
                        .is_ok(),
                    None => false,
                };
                if alive {
                    return ControlError::Rejected(message);
                }
                debug!(message = %message, "control session failed health check");
                ControlError::Closed
            }
            other => other,
        };

        if err.is_connection() {
            self.mark_broken(slot, &err);
        }
        err
    }

    /// Drop the session and report the loss once on the notification feed.
    fn mark_broken(&self, slot: &mut Option<Session>, err: &ControlError) {
        if slot.take().is_none() {
            return;
        }

        warn!(error = %err, "control session broken, reconnecting on next use");
        self.metrics.control_connected.set(0.0);
        let _ = self.events_tx.send(ControlEvent::SessionClosed);
    }

    fn count<T>(&self, result: &Result<T, ControlError>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        self.metrics
            .control_requests
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Reads notifications off the session while no call needs it.
///
/// A waiting read is abandoned as soon as a caller queues for the lock; the
/// fair session mutex then hands the lock to that caller first.
async fn pump_events(shared: Arc<Shared>) {
    loop {
        let mut slot = shared.session.lock().await;

        let Some(session) = slot.as_mut().filter(|s| s.is_subscribed()) else {
            drop(slot);
            shared.subscribed.notified().await;
            continue;
        };

        let received = tokio::select! {
            biased;

            _ = shared.wanted.notified() => None,
            received = session.recv_event() => Some(received),
        };

        match received {
            None => {}
            Some(Ok(event)) => match ControlEvent::from_parsed(event) {
                Some(event) => {
                    let _ = shared.events_tx.send(event);
                }
                None => debug!("ignoring unsubscribed control notification"),
            },
            Some(Err(e)) => {
                let err = shared.settle(&mut slot, e).await;
                if !err.is_connection() {
                    debug!(error = %err, "ignoring unreadable control notification");
                }
            }
        }

        drop(slot);
    }
}

impl ControlPort for ControlManager {
    async fn connect(&self) -> Result<(), ControlError> {
        let mut slot = self.shared.lock_session().await;
        self.shared.ensure_session(&mut slot).await.map(|_| ())
    }

    async fn subscribe(&self, kinds: &[EventKind]) -> Result<(), ControlError> {
        *self.shared.subscriptions.lock() = kinds.to_vec();
        self.ensure_pump();

        let mut slot = self.shared.lock_session().await;
        if slot.is_none() {
            // Opening a session subscribes it.
            self.shared.ensure_session(&mut slot).await?;
            return Ok(());
        }

        let session = self.shared.ensure_session(&mut slot).await?;
        let result = session.set_events(kinds, self.shared.cfg.request_timeout).await;

        match result {
            Ok(()) => {
                self.shared.subscribed.notify_one();
                Ok(())
            }
            Err(e) => Err(self.shared.settle(&mut slot, e).await),
        }
    }

    async fn circuits(&self) -> Result<Vec<Circuit>, ControlError> {
        let value = self.request("circuit-status").await?;
        Ok(status::parse_circuit_status(&value)?)
    }

    async fn network_status(
        &self,
        fingerprint: &str,
    ) -> Result<Option<RouterStatusEntry>, ControlError> {
        match self.request(&format!("ns/id/{fingerprint}")).await {
            Ok(value) => Ok(Some(status::parse_router_status(fingerprint, &value)?)),
            // Unknown relays are refused while the session stays healthy.
            Err(ControlError::Rejected(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn country(&self, address: &str) -> Result<Option<String>, ControlError> {
        let value = self.request(&format!("ip-to-country/{address}")).await?;
        Ok(status::parse_country(&value))
    }

    async fn traffic(&self) -> Result<TrafficCounters, ControlError> {
        let read = self.request("traffic/read").await?;
        let written = self.request("traffic/written").await?;

        Ok(TrafficCounters {
            read: status::parse_counter(&read)?,
            written: status::parse_counter(&written)?,
        })
    }
}
