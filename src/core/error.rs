//! Plugin Error Types
//!
//! Errors surfaced to the workflow engine carry a stable [`ErrorCode`]
//! so callers can branch on the failure kind without matching on text.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::resource::ResourceError;
use super::state::StateError;

/// Stable identifiers for failures surfaced to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    /// Malformed or incomplete task template
    BadTaskSpecification,
    /// The work-unit template could not be derived
    PodTemplateFailed,
    /// A command placeholder could not be substituted
    CmdTemplateFailed,
    /// The cluster refused a work unit
    SubmitJobFailed,
    /// The task type version is not understood
    GetTaskTypeVersionFailed,
    /// One or more children failed abort/finalize
    SubTasksLifecycleFailed,
}

impl ErrorCode {
    /// Returns the wire identifier of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadTaskSpecification => "BadTaskSpecification",
            Self::PodTemplateFailed => "POD_TEMPLATE_FAILED",
            Self::CmdTemplateFailed => "CMD_TEMPLATE_FAILED",
            Self::SubmitJobFailed => "SUBMIT_JOB_FAILED",
            Self::GetTaskTypeVersionFailed => "GET_TASK_TYPE_VERSION_FAILED",
            Self::SubTasksLifecycleFailed => "SUBTASKS_LIFECYCLE_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned to the engine by the array-job controller.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A task-level failure tagged with its code.
    #[error("[{code}] {message}")]
    Task { code: ErrorCode, message: String },

    /// Composed failure of a per-child lifecycle loop.
    ///
    /// Renders as the bounded summary only, so its text never exceeds
    /// the configured maximum error length.
    #[error("{summary}")]
    SubTasks { failed: Vec<usize>, summary: String },

    #[error("plugin state: {0}")]
    State(#[from] StateError),

    #[error("resource manager: {0}")]
    Resource(#[from] ResourceError),
}

impl PluginError {
    /// Creates a task-level error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Task {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorCode::BadTaskSpecification`].
    pub fn bad_spec(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadTaskSpecification, message)
    }

    /// Returns the stable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Task { code, .. } => code.as_str(),
            Self::SubTasks { .. } => ErrorCode::SubTasksLifecycleFailed.as_str(),
            Self::State(_) => "STATE_STORE_FAILED",
            Self::Resource(_) => "RESOURCE_MANAGER_FAILED",
        }
    }

    /// Returns true for malformed-template errors, which are never retried.
    pub fn is_specification_error(&self) -> bool {
        matches!(
            self,
            Self::Task {
                code: ErrorCode::BadTaskSpecification
                    | ErrorCode::GetTaskTypeVersionFailed
                    | ErrorCode::CmdTemplateFailed
                    | ErrorCode::PodTemplateFailed,
                ..
            }
        )
    }
}
