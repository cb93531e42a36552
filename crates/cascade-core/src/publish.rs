//! Snapshot publication to external consumers.
//!
//! The engine computes [`SystemSnapshot`]s on a fixed virtual-time cadence
//! and hands them to a set of registered sinks. Publication is
//! fire-and-forget: a sink that keeps failing is warned about and skipped,
//! and never stalls or aborts the simulation.

use log::warn;
use thiserror::Error;

use crate::metrics::SystemSnapshot;

/// Attempts per sink per snapshot before giving up.
const DEFAULT_PUBLISH_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink cannot accept snapshots right now; retrying may help.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The sink refused this snapshot; retrying will not help.
    #[error("sink rejected snapshot: {0}")]
    Rejected(String),
}

/// A destination for published snapshots.
pub trait SnapshotSink: std::fmt::Debug {
    /// Name used in publish-failure diagnostics.
    fn name(&self) -> &str;

    fn publish(&mut self, snapshot: &SystemSnapshot) -> Result<(), SinkError>;
}

/// Fans one snapshot out to every registered sink with bounded retries.
#[derive(Debug)]
pub struct SinkPublisher {
    sinks: Vec<Box<dyn SnapshotSink>>,
    max_attempts: u32,
}

impl SinkPublisher {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            sinks: Vec::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn SnapshotSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Publish to every sink. A rejection stops retries for that sink;
    /// an unavailable sink is retried up to the attempt budget. Failures
    /// are logged and isolated per sink.
    pub fn publish(&mut self, snapshot: &SystemSnapshot) {
        for sink in &mut self.sinks {
            let mut outcome = Ok(());
            for attempt in 1..=self.max_attempts {
                outcome = sink.publish(snapshot);
                match &outcome {
                    Ok(()) | Err(SinkError::Rejected(_)) => break,
                    Err(SinkError::Unavailable(_)) if attempt < self.max_attempts => {}
                    Err(_) => break,
                }
            }
            if let Err(err) = outcome {
                warn!(
                    "snapshot {} at {}ms not published to {}: {err}",
                    snapshot.run_id,
                    snapshot.virtual_time_ms,
                    sink.name(),
                );
            }
        }
    }
}

impl Default for SinkPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLISH_ATTEMPTS)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
