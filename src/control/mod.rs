pub mod event;
pub mod manager;
pub mod session;
pub mod status;

use std::future::Future;
use std::time::Duration;

use stem_rs::descriptor::router_status::RouterStatusEntry;
use thiserror::Error;

use self::event::{Circuit, EventKind, TrafficCounters};
use self::status::ParseError;

pub use self::manager::ControlManager;

/// Errors raised by control-channel calls.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control port unavailable: {0}")]
    Unavailable(String),

    #[error("control session lost")]
    Closed,

    #[error("no control session")]
    NotConnected,

    #[error("control request timed out after {0:?}")]
    Timeout(Duration),

    #[error("control port authentication failed: {0}")]
    Authentication(String),

    #[error("malformed control reply: {0}")]
    Parse(#[from] ParseError),

    #[error("control request rejected: {0}")]
    Rejected(String),
}

impl ControlError {
    /// True when the session can no longer be trusted and must be rebuilt.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Closed | Self::NotConnected | Self::Timeout(_)
        )
    }

    /// Returns a short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Closed => "closed",
            Self::NotConnected => "not_connected",
            Self::Timeout(_) => "timeout",
            Self::Authentication(_) => "authentication",
            Self::Parse(_) => "parse",
            Self::Rejected(_) => "rejected",
        }
    }
}

// The library does not say whether a failed command left the connection
// usable; the manager settles that by probing the session.
impl From<stem_rs::Error> for ControlError {
    fn from(err: stem_rs::Error) -> Self {
        match err {
            stem_rs::Error::Authentication(_) => Self::Authentication(err.to_string()),
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Query surface of the control channel used by the pipeline.
///
/// [`ControlManager`] implements this over the live session; tests provide
/// in-memory implementations.
pub trait ControlPort: Send + Sync + 'static {
    /// Establish the session if it is not already up. Idempotent.
    fn connect(&self) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// Subscribe the notification feed to the given classes, connecting
    /// first if needed. The subscription survives reconnects.
    fn subscribe(
        &self,
        kinds: &[EventKind],
    ) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// All circuits the relay currently knows about, in its enumeration order.
    fn circuits(&self) -> impl Future<Output = Result<Vec<Circuit>, ControlError>> + Send;

    /// Router status for a relay, or `None` if the relay is not in the consensus.
    fn network_status(
        &self,
        fingerprint: &str,
    ) -> impl Future<Output = Result<Option<RouterStatusEntry>, ControlError>> + Send;

    /// Country label the relay assigns to an address, or `None` if unmapped.
    fn country(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Option<String>, ControlError>> + Send;

    /// Cumulative bytes read and written by the relay.
    fn traffic(&self) -> impl Future<Output = Result<TrafficCounters, ControlError>> + Send;
}
