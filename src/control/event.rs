use std::fmt;

use stem_rs::events::ParsedEvent;
use stem_rs::EventType;

/// Lifecycle state of a circuit as reported by the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Built,
    GuardWait,
    Extended,
    Failed,
    Closed,
    Other(String),
}

impl CircuitStatus {
    /// Returns the control-protocol keyword.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Launched => "LAUNCHED",
            Self::Built => "BUILT",
            Self::GuardWait => "GUARD_WAIT",
            Self::Extended => "EXTENDED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
            Self::Other(raw) => raw,
        }
    }

    /// Convert from a status name, either the protocol keyword
    /// (`GUARD_WAIT`) or its variant spelling (`GuardWait`).
    pub fn parse(raw: &str) -> Self {
        match keyword(raw).as_str() {
            "LAUNCHED" => Self::Launched,
            "BUILT" => Self::Built,
            "GUARDWAIT" => Self::GuardWait,
            "EXTENDED" => Self::Extended,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a stream as reported by the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    Other(String),
}

impl StreamStatus {
    /// Returns the control-protocol keyword.
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "NEW",
            Self::NewResolve => "NEWRESOLVE",
            Self::Remap => "REMAP",
            Self::SentConnect => "SENTCONNECT",
            Self::SentResolve => "SENTRESOLVE",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
            Self::Detached => "DETACHED",
            Self::Other(raw) => raw,
        }
    }

    /// Convert from a status name, either the protocol keyword or its
    /// variant spelling.
    pub fn parse(raw: &str) -> Self {
        match keyword(raw).as_str() {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "REMAP" => Self::Remap,
            "SENTCONNECT" => Self::SentConnect,
            "SENTRESOLVE" => Self::SentResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn keyword(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One relay in a circuit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Hex identity fingerprint, without the leading `$`.
    pub fingerprint: String,
    pub nickname: Option<String>,
}

impl Hop {
    pub fn new(fingerprint: impl Into<String>, nickname: Option<&str>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            nickname: nickname.map(str::to_string),
        }
    }

    /// From a `$FINGERPRINT~nickname` long name; the nickname part and the
    /// leading `$` are optional.
    pub fn from_long_name(name: &str) -> Self {
        let name = name.strip_prefix('$').unwrap_or(name);
        match name.split_once(['~', '=']) {
            Some((fingerprint, nickname)) => Self::new(fingerprint, Some(nickname)),
            None => Self::new(name, None),
        }
    }
}

/// A circuit and its ordered path, entry first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: String,
    pub status: CircuitStatus,
    pub path: Vec<Hop>,
}

impl Circuit {
    pub fn is_built(&self) -> bool {
        self.status == CircuitStatus::Built
    }
}

/// A stream lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub id: String,
    pub status: StreamStatus,
    /// `None` when the stream is not attached to a circuit (circuit id `0`).
    pub circuit_id: Option<String>,
    /// Target as `address:port`.
    pub target: Option<String>,
}

/// Cumulative byte counters reported by the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub read: u64,
    pub written: u64,
}

/// Asynchronous notification delivered on the subscription feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Circuit(Circuit),
    Stream(StreamEvent),
    /// The session that produced the feed has gone away.
    SessionClosed,
}

impl ControlEvent {
    /// Returns the label used in logs and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Circuit(_) => "circ",
            Self::Stream(_) => "stream",
            Self::SessionClosed => "session_closed",
        }
    }
}

/// Notification classes the subscription feed can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Circuit,
    Stream,
}

impl EventKind {
    /// Returns the `SETEVENTS` keyword.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Circuit => "CIRC",
            Self::Stream => "STREAM",
        }
    }

    pub const fn event_type(self) -> EventType {
        match self {
            Self::Circuit => EventType::Circ,
            Self::Stream => EventType::Stream,
        }
    }
}

impl ControlEvent {
    /// Convert a notification from the control library. Classes the
    /// pipeline does not consume yield `None`.
    pub fn from_parsed(event: ParsedEvent) -> Option<Self> {
        match event {
            ParsedEvent::Circuit(e) => Some(Self::Circuit(Circuit {
                id: e.id.0.clone(),
                status: CircuitStatus::parse(&format!("{:?}", e.status)),
                path: e
                    .path
                    .iter()
                    .map(|(fp, nickname)| Hop {
                        fingerprint: fp.trim_start_matches('$').to_string(),
                        nickname: nickname.clone(),
                    })
                    .collect(),
            })),
            ParsedEvent::Stream(e) => Some(Self::Stream(StreamEvent {
                id: e.id.0.clone(),
                status: StreamStatus::parse(&format!("{:?}", e.status)),
                // Unattached streams report circuit `0`.
                circuit_id: e
                    .circ_id
                    .as_ref()
                    .map(|c| c.0.clone())
                    .filter(|id| id != "0"),
                target: Some(format!("{}:{}", e.target_address, e.target_port)),
            })),
            _ => None,
        }
    }
}
