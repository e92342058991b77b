//! Task Phase Events
//!
//! Phase transitions of a task are reported to the engine's event sink.
//! Recording is best-effort: a failed record never fails a round.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task phase as understood by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Waiting for quota or capacity
    WaitingForResources,
    Queued,
    Running,
    Success,
    /// Finished, but some tolerated children failed
    PartialSuccess,
    PermanentFailure,
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::PartialSuccess | Self::PermanentFailure | Self::Aborted
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One phase transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PhaseInfo {
    pub phase: Phase,
    /// Incremented on every recorded transition of a task
    pub version: u32,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl PhaseInfo {
    pub fn new(phase: Phase, version: u32, reason: impl Into<String>) -> Self {
        Self {
            phase,
            version,
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event sink unavailable: {0}")]
    Unavailable(String),
}

/// Sink for task phase events.
pub trait EventsRecorder: Send + Sync {
    fn record_raw(&self, event: &PhaseInfo) -> Result<(), EventError>;
}

/// Recorder keeping events in memory and rendering a timeline report.
#[derive(Debug)]
pub struct TimelineRecorder {
    events: Mutex<Vec<PhaseInfo>>,
    start_time: DateTime<Utc>,
}

impl TimelineRecorder {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_time: Utc::now(),
        }
    }

    /// Returns all recorded events.
    pub fn events(&self) -> Vec<PhaseInfo> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Milliseconds spent in each phase, up to the latest event.
    pub fn phase_durations(&self) -> BTreeMap<Phase, i64> {
        let events = self.events();
        let mut durations = BTreeMap::new();
        for pair in events.windows(2) {
            let spent = (pair[1].occurred_at - pair[0].occurred_at).num_milliseconds();
            *durations.entry(pair[0].phase).or_insert(0) += spent;
        }
        durations
    }

    /// Renders the timeline as text, one line per event.
    pub fn report(&self) -> String {
        let mut output = String::from("\nPhase Timeline:\n\n");
        for event in self.events() {
            let offset = (event.occurred_at - self.start_time).num_milliseconds();
            output.push_str(&format!(
                "{:>8} ms  {:<20} v{:<3} {}\n",
                offset,
                event.phase.to_string(),
                event.version,
                event.reason
            ));
        }
        output
    }
}

impl Default for TimelineRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventsRecorder for TimelineRecorder {
    fn record_raw(&self, event: &PhaseInfo) -> Result<(), EventError> {
        info!("Task phase -> {} (v{}): {}", event.phase, event.version, event.reason);
        self.events
            .lock()
            .map_err(|_| EventError::Unavailable("timeline lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}
