//! Array Task Plugin
//!
//! Fans one logical task out into `size` identical children, each running
//! as its own cluster unit.
//!
//! # Structure
//!
//! - [`controller`]: Round-driven launch/poll/abort/finalize of all children
//! - [`task`]: Operations on a single child
//! - [`transformer`]: Derives work units from the task template
//! - [`state`]: Per-child and aggregate phases persisted between rounds
//! - [`errors`]: Bounded aggregation of per-child failures
//! - [`config`]: Operator settings

pub mod config;
pub mod controller;
pub mod errors;
pub mod state;
pub mod task;
pub mod transformer;

pub use config::{Config, ConfigError, MetadataPrecedence, ResourceQuota};
pub use controller::ArrayJobController;
pub use errors::ErrorMessageCollector;
pub use state::{ArrayJobState, ArrayPhase, ChildPhase, ChildState, PhaseCounts};
pub use transformer::{array_job_to_pod_template, build_child_pod, build_pod_map_task};
