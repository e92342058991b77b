//! Per-Child Operations
//!
//! Everything the controller does to one child: admission, submission,
//! polling, abort and cleanup. Each operation takes the child's state as of
//! round start and returns its next state; nothing here touches the shared
//! array state, so children can be processed concurrently.

use log::{debug, info, warn};

use crate::cluster::{Cluster, ClusterError, Pod, PodPhase};
use crate::core::error::{ErrorCode, PluginError};
use crate::core::resource::{AllocationStatus, ResourceConstraintsSpec, ResourceError, ResourceManager};

use super::config::ResourceQuota;
use super::state::{ChildPhase, ChildState};
use super::transformer::format_sub_task_name;

/// Shared handles for operating on the children of one array task.
pub struct ChildOps<'a> {
    pub cluster: &'a dyn Cluster,
    pub resources: Option<(&'a dyn ResourceManager, &'a ResourceQuota)>,
    pub namespace: &'a str,
    pub parent_name: &'a str,
    pub max_retries: u32,
}

impl<'a> ChildOps<'a> {
    /// Name of the unit backing a child's current attempt.
    pub fn unit_name(&self, index: usize, child: &ChildState) -> String {
        format_sub_task_name(self.parent_name, index, child.attempt)
    }

    /// Admission token of a child; stable across attempts.
    pub fn token(&self, index: usize) -> String {
        format!("{}/{}/{}", self.namespace, self.parent_name, index)
    }

    fn constraints(&self, quota: &ResourceQuota) -> ResourceConstraintsSpec {
        match quota.namespace_limit {
            Some(limit) => ResourceConstraintsSpec::default()
                .with_constraint(format!("{}/", self.namespace), limit),
            None => ResourceConstraintsSpec::default(),
        }
    }

    fn admit(&self, index: usize) -> Result<AllocationStatus, ResourceError> {
        match self.resources {
            Some((manager, quota)) => {
                manager.allocate(&quota.namespace, &self.token(index), &self.constraints(quota))
            }
            None => Ok(AllocationStatus::Granted),
        }
    }

    /// Gives back a child's admission token; a no-op when none is held.
    pub fn release(&self, index: usize) -> Result<(), ResourceError> {
        match self.resources {
            Some((manager, quota)) => manager.release(&quota.namespace, &self.token(index)),
            None => Ok(()),
        }
    }

    fn release_quietly(&self, index: usize) {
        if let Err(e) = self.release(index) {
            warn!("Failed to release token of child {}: {}", index, e);
        }
    }

    /// Admits and submits the unit of a child waiting to launch.
    ///
    /// Denied admission leaves the child waiting for a later round. Only a
    /// broken resource manager is an error.
    pub fn launch(&self, index: usize, child: &ChildState, pod: &Pod) -> Result<ChildState, PluginError> {
        let mut next = child.clone();

        let status = self.admit(index)?;
        if status != AllocationStatus::Granted {
            debug!("Child {} not admitted: {:?}", index, status);
            next.phase = ChildPhase::WaitingForResources;
            return Ok(next);
        }

        let name = &pod.metadata.name;
        match self.cluster.submit(pod) {
            Ok(()) => {
                debug!("Submitted unit '{}'", name);
                next.phase = ChildPhase::Queued;
            }
            Err(ClusterError::AlreadyExists(_)) => {
                info!("Unit '{}' already exists, adopting it", name);
                next.phase = ChildPhase::Queued;
            }
            Err(ClusterError::Transient(msg)) => {
                warn!("Submitting unit '{}' failed, will retry: {}", name, msg);
                self.release_quietly(index);
            }
            Err(e) => {
                let err = PluginError::new(
                    ErrorCode::SubmitJobFailed,
                    format!("failed to submit unit '{}': {}", name, e),
                );
                warn!("Child {} failed permanently: {}", index, err);
                next.phase = ChildPhase::Failed;
                next.message = Some(err.to_string());
                self.release_quietly(index);
            }
        }
        Ok(next)
    }

    /// Polls the unit of an active child and maps its phase.
    pub fn monitor(&self, index: usize, child: &ChildState) -> ChildState {
        let name = self.unit_name(index, child);
        let mut next = child.clone();

        let status = match self.cluster.status(self.namespace, &name) {
            Ok(status) => status,
            Err(e) => {
                warn!("Polling unit '{}' failed: {}", name, e);
                return next;
            }
        };

        match status {
            None => self.fail_attempt(index, next, format!("unit '{}' not found", name)),
            Some(status) => match status.phase {
                PodPhase::Pending => {
                    next.phase = ChildPhase::Queued;
                    next
                }
                PodPhase::Running => {
                    next.phase = ChildPhase::Running;
                    next
                }
                PodPhase::Succeeded => {
                    debug!("Unit '{}' succeeded", name);
                    next.phase = ChildPhase::Succeeded;
                    next.message = None;
                    self.release_quietly(index);
                    next
                }
                PodPhase::Failed => {
                    let message = status
                        .message
                        .unwrap_or_else(|| format!("unit '{}' failed", name));
                    self.fail_attempt(index, next, message)
                }
                PodPhase::Unknown => next,
            },
        }
    }

    /// Records a failed attempt, scheduling a retry while the budget lasts.
    fn fail_attempt(&self, index: usize, mut next: ChildState, message: String) -> ChildState {
        if next.attempt < self.max_retries {
            let name = self.unit_name(index, &next);
            match self.cluster.delete(self.namespace, &name) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    // Next round polls the failed unit again and retries the delete
                    warn!("Deleting failed unit '{}' failed: {}", name, e);
                    return next;
                }
            }
            info!(
                "Child {} attempt {} failed, retrying: {}",
                index, next.attempt, message
            );
            next.attempt += 1;
            next.phase = ChildPhase::RetryableFailure;
        } else {
            warn!("Child {} failed: {}", index, message);
            next.phase = ChildPhase::Failed;
        }
        next.message = Some(message);
        self.release_quietly(index);
        next
    }

    /// Requests termination of a child's unit; a missing unit is fine.
    pub fn abort(&self, index: usize, child: &ChildState) -> Result<(), String> {
        let name = self.unit_name(index, child);
        match self.cluster.terminate(self.namespace, &name) {
            Ok(()) => debug!("Terminated unit '{}'", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(format!("failed to terminate unit '{}': {}", name, e)),
        }
        self.release(index).map_err(|e| e.to_string())
    }

    /// Deletes a child's unit and releases its token; a missing unit is fine.
    pub fn finalize(&self, index: usize, child: &ChildState) -> Result<(), String> {
        let name = self.unit_name(index, child);
        match self.cluster.delete(self.namespace, &name) {
            Ok(()) => debug!("Deleted unit '{}'", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(format!("failed to delete unit '{}': {}", name, e)),
        }
        self.release(index).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PodStatus;
    use crate::core::resource::{InMemoryResourcePool, ResourceNamespace};
    use crate::testing::FakeCluster;

    fn pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = name.to_string();
        pod.metadata.namespace = "ns".to_string();
        pod
    }

    fn ops<'a>(cluster: &'a FakeCluster) -> ChildOps<'a> {
        ChildOps {
            cluster,
            resources: None,
            namespace: "ns",
            parent_name: "exec",
            max_retries: 0,
        }
    }

    fn child(phase: ChildPhase) -> ChildState {
        ChildState {
            phase,
            ..ChildState::new()
        }
    }

    #[test]
    fn test_launch_submits_unit() {
        let cluster = FakeCluster::new();
        let next = ops(&cluster)
            .launch(0, &child(ChildPhase::NotStarted), &pod("exec-0"))
            .unwrap();
        assert_eq!(next.phase, ChildPhase::Queued);
        assert!(cluster.has_unit("ns", "exec-0"));
    }

    #[test]
    fn test_launch_adopts_existing_unit() {
        let cluster = FakeCluster::new();
        cluster.submit(&pod("exec-0")).unwrap();
        let next = ops(&cluster)
            .launch(0, &child(ChildPhase::NotStarted), &pod("exec-0"))
            .unwrap();
        assert_eq!(next.phase, ChildPhase::Queued);
    }

    #[test]
    fn test_launch_transient_and_rejected() {
        let cluster = FakeCluster::new();
        cluster.fail_submit("exec-0", ClusterError::Transient("busy".into()));
        cluster.fail_submit("exec-1", ClusterError::Rejected("quota".into()));

        let next = ops(&cluster)
            .launch(0, &child(ChildPhase::NotStarted), &pod("exec-0"))
            .unwrap();
        assert_eq!(next.phase, ChildPhase::NotStarted);

        let next = ops(&cluster)
            .launch(1, &child(ChildPhase::NotStarted), &pod("exec-1"))
            .unwrap();
        assert_eq!(next.phase, ChildPhase::Failed);
        assert!(next.message.unwrap().starts_with("[SUBMIT_JOB_FAILED]"));
    }

    #[test]
    fn test_launch_waits_for_admission() {
        let cluster = FakeCluster::new();
        let pool = InMemoryResourcePool::new();
        let quota = ResourceQuota {
            namespace: ResourceNamespace::new("gpu"),
            capacity: 1,
            namespace_limit: None,
        };
        pool.register(quota.namespace.clone(), quota.capacity).unwrap();

        let ops = ChildOps {
            resources: Some((&pool as &dyn ResourceManager, &quota)),
            ..ops(&cluster)
        };

        let first = ops.launch(0, &child(ChildPhase::NotStarted), &pod("exec-0")).unwrap();
        let second = ops.launch(1, &child(ChildPhase::NotStarted), &pod("exec-1")).unwrap();
        assert_eq!(first.phase, ChildPhase::Queued);
        assert_eq!(second.phase, ChildPhase::WaitingForResources);
        assert!(pool.is_held(&quota.namespace, "ns/exec/0"));

        // Finishing child 0 frees the slot
        cluster.set_status("ns", "exec-0", PodStatus::new(PodPhase::Succeeded));
        let done = ops.monitor(0, &first);
        assert_eq!(done.phase, ChildPhase::Succeeded);
        assert_eq!(pool.held(&quota.namespace), 0);

        let second = ops.launch(1, &second, &pod("exec-1")).unwrap();
        assert_eq!(second.phase, ChildPhase::Queued);
    }

    #[test]
    fn test_monitor_maps_phases() {
        let cluster = FakeCluster::new();
        cluster.submit(&pod("exec-0")).unwrap();
        let ops = ops(&cluster);
        let queued = child(ChildPhase::Queued);

        assert_eq!(ops.monitor(0, &queued).phase, ChildPhase::Queued);

        cluster.set_status("ns", "exec-0", PodStatus::new(PodPhase::Running));
        assert_eq!(ops.monitor(0, &queued).phase, ChildPhase::Running);

        cluster.set_status("ns", "exec-0", PodStatus::new(PodPhase::Unknown));
        assert_eq!(ops.monitor(0, &queued).phase, ChildPhase::Queued);

        cluster.set_status(
            "ns",
            "exec-0",
            PodStatus::new(PodPhase::Failed).with_message("OOMKilled"),
        );
        let failed = ops.monitor(0, &queued);
        assert_eq!(failed.phase, ChildPhase::Failed);
        assert_eq!(failed.message.as_deref(), Some("OOMKilled"));
    }

    #[test]
    fn test_monitor_retries_failed_unit() {
        let cluster = FakeCluster::new();
        cluster.submit(&pod("exec-0")).unwrap();
        cluster.set_status("ns", "exec-0", PodStatus::new(PodPhase::Failed));
        let ops = ChildOps {
            max_retries: 1,
            ..ops(&cluster)
        };

        let next = ops.monitor(0, &child(ChildPhase::Running));
        assert_eq!(next.phase, ChildPhase::RetryableFailure);
        assert_eq!(next.attempt, 1);
        assert!(!cluster.has_unit("ns", "exec-0"));
        assert_eq!(ops.unit_name(0, &next), "exec-0-1");

        // Second failure exhausts the budget
        cluster.submit(&pod("exec-0-1")).unwrap();
        cluster.set_status("ns", "exec-0-1", PodStatus::new(PodPhase::Failed));
        let mut running = next;
        running.phase = ChildPhase::Running;
        assert_eq!(ops.monitor(0, &running).phase, ChildPhase::Failed);
    }

    #[test]
    fn test_monitor_missing_unit_is_failed_attempt() {
        let cluster = FakeCluster::new();
        let next = ops(&cluster).monitor(2, &child(ChildPhase::Running));
        assert_eq!(next.phase, ChildPhase::Failed);
        assert!(next.message.unwrap().contains("exec-2"));
    }

    #[test]
    fn test_abort_and_finalize_tolerate_missing_units() {
        let cluster = FakeCluster::new();
        let ops = ops(&cluster);
        let state = child(ChildPhase::NotStarted);

        assert!(ops.abort(0, &state).is_ok());
        assert!(ops.finalize(0, &state).is_ok());

        cluster.submit(&pod("exec-1")).unwrap();
        assert!(ops.abort(1, &state).is_ok());
        assert!(ops.finalize(1, &state).is_ok());
        assert!(!cluster.has_unit("ns", "exec-1"));
    }
}
