//! Live circuit telemetry for an onion-routing relay.
//!
//! Keeps one authenticated control-port session, turns circuit and stream
//! notifications into enriched telemetry, and fans it out to live viewers.

pub mod agent;
pub mod config;
pub mod control;
pub mod delivery;
pub mod geo;
pub mod metrics;
pub mod pipeline;
pub mod relay;
pub mod traffic;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
