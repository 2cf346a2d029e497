//! Classification, queueing and dispatch of circuit telemetry.
//!
//! ```text
//! control feed -> Listener -> Classifier -> queue -> Dispatcher -> Transport
//!                                 |                      |
//!                              Enricher          SnapshotCollector
//! ```

pub mod classifier;
pub mod dispatcher;
pub mod event;
pub mod listener;
pub mod queue;
pub mod snapshot;

pub use self::classifier::{Classification, Classifier, DropReason};
pub use self::dispatcher::Dispatcher;
pub use self::event::{Payload, TelemetryEvent};
pub use self::listener::Listener;
pub use self::snapshot::SnapshotCollector;
