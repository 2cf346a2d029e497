//! In-memory stand-ins for the control channel, the geolocation database and
//! the delivery transport.

use std::collections::HashMap;

use parking_lot::Mutex;
use stem_rs::descriptor::router_status::{RouterStatusEntry, RouterStatusEntryType};

use crate::control::event::{Circuit, CircuitStatus, EventKind, Hop, TrafficCounters};
use crate::control::{ControlError, ControlPort};
use crate::delivery::Transport;
use crate::geo::{GeoLocation, GeoLocator};
use crate::pipeline::event::Payload;

/// A BUILT circuit with the given `(fingerprint, nickname)` path.
pub fn circuit(id: &str, path: &[(&str, &str)]) -> Circuit {
    Circuit {
        id: id.to_string(),
        status: CircuitStatus::Built,
        path: path.iter().map(|(fp, nick)| Hop::new(*fp, Some(nick))).collect(),
    }
}

#[derive(Default)]
struct FakeState {
    circuits: Vec<Circuit>,
    relays: HashMap<String, RouterStatusEntry>,
    countries: HashMap<String, String>,
    traffic: TrafficCounters,
    subscriptions: Vec<EventKind>,
    auth_failure: Option<String>,
    fail_connect: bool,
    fail_circuits: bool,
    fail_country: bool,
    connects: usize,
    circuit_queries: usize,
}

/// [`ControlPort`] over mutable in-memory relay state.
#[derive(Default)]
pub struct FakeControl {
    state: Mutex<FakeState>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a consensus entry. Panics if `address` is not an IP literal.
    pub fn add_relay(&self, fingerprint: &str, nickname: &str, address: &str, bandwidth: Option<u64>) {
        let mut entry = RouterStatusEntry::new(
            RouterStatusEntryType::V3,
            nickname.to_string(),
            fingerprint.to_string(),
            chrono::Utc::now(),
            address.parse().expect("relay address must be an IP literal"),
            9001,
        );
        entry.bandwidth = bandwidth;
        self.state.lock().relays.insert(fingerprint.to_string(), entry);
    }

    pub fn set_country(&self, address: &str, country: &str) {
        self.state
            .lock()
            .countries
            .insert(address.to_string(), country.to_string());
    }

    pub fn set_circuits(&self, circuits: Vec<Circuit>) {
        self.state.lock().circuits = circuits;
    }

    pub fn set_traffic(&self, read: u64, written: u64) {
        self.state.lock().traffic = TrafficCounters { read, written };
    }

    /// Make `connect` and `subscribe` fail authentication with `message`.
    pub fn fail_auth(&self, message: &str) {
        self.state.lock().auth_failure = Some(message.to_string());
    }

    /// Make `connect` and `subscribe` fail as if the port were unreachable.
    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn fail_circuits(&self, fail: bool) {
        self.state.lock().fail_circuits = fail;
    }

    pub fn fail_country(&self, fail: bool) {
        self.state.lock().fail_country = fail;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn circuit_queries(&self) -> usize {
        self.state.lock().circuit_queries
    }

    pub fn subscriptions(&self) -> Vec<EventKind> {
        self.state.lock().subscriptions.clone()
    }

    fn try_connect(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        state.connects += 1;

        if let Some(message) = &state.auth_failure {
            return Err(ControlError::Authentication(message.clone()));
        }
        if state.fail_connect {
            return Err(ControlError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl ControlPort for FakeControl {
    async fn connect(&self) -> Result<(), ControlError> {
        self.try_connect()
    }

    async fn subscribe(&self, kinds: &[EventKind]) -> Result<(), ControlError> {
        self.try_connect()?;
        self.state.lock().subscriptions = kinds.to_vec();
        Ok(())
    }

    async fn circuits(&self) -> Result<Vec<Circuit>, ControlError> {
        let mut state = self.state.lock();
        state.circuit_queries += 1;
        if state.fail_circuits {
            return Err(ControlError::Closed);
        }
        Ok(state.circuits.clone())
    }

    async fn network_status(
        &self,
        fingerprint: &str,
    ) -> Result<Option<RouterStatusEntry>, ControlError> {
        Ok(self.state.lock().relays.get(fingerprint).cloned())
    }

    async fn country(&self, address: &str) -> Result<Option<String>, ControlError> {
        let state = self.state.lock();
        if state.fail_country {
            return Err(ControlError::Timeout(std::time::Duration::from_secs(1)));
        }
        Ok(state.countries.get(address).cloned())
    }

    async fn traffic(&self) -> Result<TrafficCounters, ControlError> {
        Ok(self.state.lock().traffic)
    }
}

/// [`GeoLocator`] over a fixed address table.
#[derive(Default)]
pub struct MemoryGeo {
    entries: HashMap<String, GeoLocation>,
}

impl MemoryGeo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, country: &str, latitude: f64, longitude: f64) -> Self {
        self.entries.insert(
            address.to_string(),
            GeoLocation {
                country: Some(country.to_string()),
                latitude,
                longitude,
            },
        );
        self
    }
}

impl GeoLocator for MemoryGeo {
    fn resolve(&self, address: &str) -> Option<GeoLocation> {
        self.entries.get(address).cloned()
    }
}

/// [`Transport`] that keeps every payload it is handed.
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<Payload>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Payload> {
        self.published.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn publish(&self, payload: Payload) {
        self.published.lock().push(payload);
    }
}
