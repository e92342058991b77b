//! Array Job State
//!
//! Per-child phases and counters of one array task, persisted between
//! rounds through the plugin state store. The aggregate phase is always
//! recomputed from the children; it is never advanced on its own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::events::Phase;

/// Lifecycle phase of one child.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPhase {
    /// No unit exists yet
    NotStarted,
    /// Admission was denied; retried next round
    WaitingForResources,
    /// Unit submitted, not yet running
    Queued,
    Running,
    Succeeded,
    /// Unit failed; a new attempt launches next round
    RetryableFailure,
    /// Failed with no retries left
    Failed,
    Aborted,
}

impl ChildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// A unit exists in the cluster for this child.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// The child needs a (new) unit submitted.
    pub fn needs_launch(&self) -> bool {
        matches!(
            self,
            Self::NotStarted | Self::WaitingForResources | Self::RetryableFailure
        )
    }
}

/// State of one child.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChildState {
    pub phase: ChildPhase,
    /// Attempt number of the current (or next) unit, starting at 0
    pub attempt: u32,
    /// Result was served from the cache
    #[serde(default)]
    pub cached: bool,
    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChildState {
    pub fn new() -> Self {
        Self {
            phase: ChildPhase::NotStarted,
            attempt: 0,
            cached: false,
            message: None,
        }
    }
}

impl Default for ChildState {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate phase of the array task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayPhase {
    Unstarted,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
    Aborted,
}

impl ArrayPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unstarted | Self::Running)
    }

    /// Maps to the phase reported to the engine.
    pub fn to_task_phase(self) -> Phase {
        match self {
            Self::Unstarted => Phase::Queued,
            Self::Running => Phase::Running,
            Self::Succeeded => Phase::Success,
            Self::PartiallyFailed => Phase::PartialSuccess,
            Self::Failed => Phase::PermanentFailure,
            Self::Aborted => Phase::Aborted,
        }
    }
}

impl fmt::Display for ArrayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Number of children in each broad phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseCounts {
    pub pending: usize,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub cached: usize,
}

impl fmt::Display for PhaseCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded ({} cached), {} failed, {} active, {} pending",
            self.succeeded, self.cached, self.failed, self.active, self.pending
        )?;
        if self.aborted > 0 {
            write!(f, ", {} aborted", self.aborted)?;
        }
        Ok(())
    }
}

/// Round-persisted state of one array task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArrayJobState {
    pub phase: ArrayPhase,
    /// Number of children; fixed at creation
    pub size: usize,
    /// Failed children tolerated before the task fails
    pub failure_threshold: usize,
    /// Version of the last phase event recorded
    pub version: u32,
    pub children: Vec<ChildState>,
}

impl ArrayJobState {
    pub fn new(size: usize, failure_threshold: usize) -> Self {
        Self {
            phase: ArrayPhase::Unstarted,
            size,
            failure_threshold,
            version: 0,
            children: (0..size).map(|_| ChildState::new()).collect(),
        }
    }

    /// Checks that the child table matches the fixed size.
    pub fn is_consistent(&self) -> bool {
        self.children.len() == self.size
    }

    pub fn child(&self, index: usize) -> Option<&ChildState> {
        self.children.get(index)
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut ChildState> {
        self.children.get_mut(index)
    }

    pub fn counts(&self) -> PhaseCounts {
        let mut counts = PhaseCounts::default();
        for child in &self.children {
            match child.phase {
                ChildPhase::Succeeded => {
                    counts.succeeded += 1;
                    if child.cached {
                        counts.cached += 1;
                    }
                }
                ChildPhase::Failed => counts.failed += 1,
                ChildPhase::Aborted => counts.aborted += 1,
                ChildPhase::Queued | ChildPhase::Running => counts.active += 1,
                ChildPhase::NotStarted
                | ChildPhase::WaitingForResources
                | ChildPhase::RetryableFailure => counts.pending += 1,
            }
        }
        counts
    }

    /// Recomputes the aggregate phase from the children.
    ///
    /// An aborted task stays aborted.
    pub fn recompute_phase(&mut self) -> ArrayPhase {
        if self.phase == ArrayPhase::Aborted {
            return self.phase;
        }

        let counts = self.counts();
        let never_launched = self
            .children
            .iter()
            .all(|c| c.phase == ChildPhase::NotStarted || c.phase == ChildPhase::WaitingForResources);

        self.phase = if counts.succeeded == self.size {
            ArrayPhase::Succeeded
        } else if counts.failed > self.failure_threshold {
            ArrayPhase::Failed
        } else if counts.succeeded + counts.failed == self.size {
            ArrayPhase::PartiallyFailed
        } else if never_launched {
            ArrayPhase::Unstarted
        } else {
            ArrayPhase::Running
        };
        self.phase
    }

    /// Phase reported to the engine.
    ///
    /// An unstarted task whose children are held back by admission control
    /// reports `WaitingForResources`.
    pub fn task_phase(&self) -> Phase {
        let waiting = self
            .children
            .iter()
            .any(|c| c.phase == ChildPhase::WaitingForResources);
        if self.phase == ArrayPhase::Unstarted && waiting {
            Phase::WaitingForResources
        } else {
            self.phase.to_task_phase()
        }
    }

    /// Marks every non-terminal child and the task as aborted.
    pub fn mark_aborted(&mut self) {
        for child in &mut self.children {
            if !child.phase.is_terminal() {
                child.phase = ChildPhase::Aborted;
            }
        }
        self.phase = ArrayPhase::Aborted;
    }
}
