use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::control::event::TrafficCounters;
use crate::control::{ControlError, ControlPort};

/// Relay throughput since the previous sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficSample {
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    /// KB/s written.
    pub upload: f64,
    /// KB/s read.
    pub download: f64,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    counters: TrafficCounters,
    at: Instant,
}

/// Converts the relay's cumulative byte counters into rates.
///
/// Each call to [`TrafficSampler::sample`] measures against the previous
/// call; the first one reports zero.
pub struct TrafficSampler<C> {
    control: Arc<C>,
    last: Mutex<Option<Reading>>,
}

impl<C: ControlPort> TrafficSampler<C> {
    pub fn new(control: Arc<C>) -> Self {
        Self {
            control,
            last: Mutex::new(None),
        }
    }

    pub async fn sample(&self) -> Result<TrafficSample, ControlError> {
        let counters = self.control.traffic().await?;
        let current = Reading {
            counters,
            at: Instant::now(),
        };

        let previous = self.last.lock().replace(current);
        let (upload, download) = match previous {
            Some(prev) => rates(prev.counters, counters, current.at.duration_since(prev.at)),
            None => (0.0, 0.0),
        };

        Ok(TrafficSample {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            upload,
            download,
        })
    }
}

/// Upload and download rates in KB/s, rounded to two decimals.
///
/// A counter that went backwards (relay restart) reports zero.
fn rates(prev: TrafficCounters, current: TrafficCounters, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return (0.0, 0.0);
    }

    let rate = |before: u64, after: u64| {
        let kb = after.saturating_sub(before) as f64 / 1024.0;
        round2(kb / secs)
    };

    (
        rate(prev.written, current.written),
        rate(prev.read, current.read),
    )
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
