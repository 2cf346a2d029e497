use serde::Serialize;

use crate::config::ObserverConfig;
use crate::control::event::Hop;
use crate::geo::GeoLocation;
use crate::relay::{or_unknown, RelayRecord, Role};

/// A stream that reached SUCCEEDED, with its circuit path enriched.
#[derive(Debug, Clone)]
pub struct StreamTelemetry {
    pub stream_id: String,
    /// Target as `address:port`, as reported.
    pub target: String,
    pub target_location: Option<GeoLocation>,
    /// Country the relay maps the target address to.
    pub target_country: Option<String>,
    pub circuit_id: String,
    pub path: Vec<RelayRecord>,
    pub observer: Option<LocalObserver>,
}

/// A circuit that reached BUILT, carrying its own unenriched path.
#[derive(Debug, Clone)]
pub struct CircuitTelemetry {
    pub circuit_id: String,
    pub path: Vec<Hop>,
}

/// Unit of work on the delivery queue.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Stream(StreamTelemetry),
    Circuit(CircuitTelemetry),
}

impl TelemetryEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Circuit(_) => "circuit",
        }
    }
}

/// Location of the machine running the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalObserver {
    pub ip: String,
    pub latitude: f64,
    pub longitude: f64,
    pub country: Option<String>,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl From<&ObserverConfig> for LocalObserver {
    fn from(cfg: &ObserverConfig) -> Self {
        Self {
            ip: cfg.ip.clone(),
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            country: cfg.country.clone(),
            kind: "Local",
        }
    }
}

/// Payload handed to the delivery transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status")]
pub enum Payload {
    #[serde(rename = "STREAM_SUCCEEDED")]
    StreamSucceeded {
        stream_target: String,
        target_geolocation: TargetGeolocation,
        circuit_id: String,
        local_public_ip: Option<LocalObserver>,
        path: Vec<PathNode>,
    },
    #[serde(rename = "CIRC_BUILT")]
    CircuitBuilt { data: Vec<MapNode> },
}

impl Payload {
    pub const STREAM_SUCCEEDED: &'static str = "STREAM_SUCCEEDED";
    pub const CIRC_BUILT: &'static str = "CIRC_BUILT";

    /// Value of the `status` tag.
    pub const fn status(&self) -> &'static str {
        match self {
            Self::StreamSucceeded { .. } => Self::STREAM_SUCCEEDED,
            Self::CircuitBuilt { .. } => Self::CIRC_BUILT,
        }
    }

    pub fn from_stream(stream: &StreamTelemetry) -> Self {
        Self::StreamSucceeded {
            stream_target: stream.target.clone(),
            target_geolocation: TargetGeolocation::new(
                stream.target_location.as_ref(),
                stream.target_country.clone(),
            ),
            circuit_id: stream.circuit_id.clone(),
            local_public_ip: stream.observer.clone(),
            path: stream.path.iter().map(PathNode::from).collect(),
        }
    }

    pub fn snapshot(nodes: &[RelayRecord]) -> Self {
        Self::CircuitBuilt {
            data: nodes.iter().map(MapNode::from).collect(),
        }
    }
}

/// Geolocation of a stream target; every field is null when unknown.
///
/// Coordinates come from the geolocation database and the country from the
/// control channel, matching how path hops are reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetGeolocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
}

impl TargetGeolocation {
    pub fn new(location: Option<&GeoLocation>, country: Option<String>) -> Self {
        Self {
            latitude: location.map(|l| l.latitude),
            longitude: location.map(|l| l.longitude),
            country,
        }
    }
}

/// One hop of a stream's circuit path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathNode {
    pub fingerprint: String,
    pub nickname: Option<String>,
    #[serde(serialize_with = "or_unknown")]
    pub ip: Option<String>,
    #[serde(serialize_with = "or_unknown")]
    pub country: Option<String>,
    #[serde(serialize_with = "or_unknown")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "type")]
    pub role: Role,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl From<&RelayRecord> for PathNode {
    fn from(r: &RelayRecord) -> Self {
        Self {
            fingerprint: r.fingerprint.clone(),
            nickname: r.nickname.clone(),
            ip: r.address.clone(),
            country: r.country.clone(),
            bandwidth: r.bandwidth,
            role: r.role,
            latitude: r.latitude(),
            longitude: r.longitude(),
        }
    }
}

/// One relay of the node-set snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapNode {
    #[serde(serialize_with = "or_unknown")]
    pub ip: Option<String>,
    #[serde(serialize_with = "or_unknown")]
    pub country: Option<String>,
    #[serde(serialize_with = "or_unknown")]
    pub bandwidth: Option<u64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(rename = "type")]
    pub role: Role,
}

impl From<&RelayRecord> for MapNode {
    fn from(r: &RelayRecord) -> Self {
        Self {
            ip: r.address.clone(),
            country: r.country.clone(),
            bandwidth: r.bandwidth,
            latitude: r.latitude(),
            longitude: r.longitude(),
            role: r.role,
        }
    }
}
