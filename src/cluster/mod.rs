//! Cluster Abstraction Module
//!
//! The array-job state machine talks to compute resources only through the
//! [`Cluster`] trait, so it stays cluster-agnostic and can be exercised
//! against fakes.
//!
//! - [`pod`]: Work-unit data model
//! - [`local`]: Runs each unit's primary container as a local process

pub mod local;
pub mod pod;

use thiserror::Error;

pub use local::LocalCluster;
pub use pod::{Container, ObjectMeta, OwnerReference, Pod, PodPhase, PodSpec, PodStatus, Toleration};

/// Failure of a cluster operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// A unit with the same name already exists.
    #[error("unit '{0}' already exists")]
    AlreadyExists(String),

    /// No unit with that name exists.
    #[error("unit '{0}' not found")]
    NotFound(String),

    /// Temporary failure; the operation may succeed in a later round.
    #[error("transient cluster failure: {0}")]
    Transient(String),

    /// The cluster refused the request permanently.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Operations the controller issues against a cluster.
///
/// None of these may block until a unit finishes; long-running work is
/// observed across rounds through [`Cluster::status`].
pub trait Cluster: Send + Sync {
    /// Creates a unit.
    fn submit(&self, pod: &Pod) -> Result<(), ClusterError>;

    /// Returns the live status of a unit, or `None` when it does not exist.
    fn status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>, ClusterError>;

    /// Requests termination of a running unit.
    fn terminate(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Removes a unit and everything backing it.
    fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
