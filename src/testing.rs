//! Test doubles shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::cluster::{Cluster, ClusterError, Pod, PodPhase, PodStatus};
use crate::core::events::{EventError, EventsRecorder, PhaseInfo};

type UnitKey = (String, String);

#[derive(Default)]
struct FakeState {
    units: BTreeMap<UnitKey, (Pod, PodStatus)>,
    submit_failures: HashMap<String, ClusterError>,
    terminate_failures: HashMap<String, ClusterError>,
    delete_failures: HashMap<String, ClusterError>,
    submitted: Vec<String>,
    terminated: Vec<String>,
    deleted: Vec<String>,
}

/// In-memory cluster with scripted statuses and per-unit failure injection.
///
/// Units start `Pending`. Calls are recorded by unit name, including the
/// ones that fail or hit a missing unit.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_submit(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().submit_failures.insert(name.to_string(), err);
    }

    pub fn fail_terminate(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().terminate_failures.insert(name.to_string(), err);
    }

    pub fn fail_delete(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().delete_failures.insert(name.to_string(), err);
    }

    /// Removes every injected failure.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.submit_failures.clear();
        state.terminate_failures.clear();
        state.delete_failures.clear();
    }

    pub fn set_status(&self, namespace: &str, name: &str, status: PodStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(unit) = state.units.get_mut(&(namespace.to_string(), name.to_string())) {
            unit.1 = status;
        }
    }

    /// Sets the status of every existing unit.
    pub fn set_all(&self, phase: PodPhase) {
        let mut state = self.state.lock().unwrap();
        for unit in state.units.values_mut() {
            unit.1 = PodStatus::new(phase);
        }
    }

    pub fn has_unit(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .units
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn unit(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .units
            .get(&(namespace.to_string(), name.to_string()))
            .map(|(pod, _)| pod.clone())
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        let mut calls = self.state.lock().unwrap().terminated.clone();
        calls.sort();
        calls
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut calls = self.state.lock().unwrap().deleted.clone();
        calls.sort();
        calls
    }
}

impl Cluster for FakeCluster {
    fn submit(&self, pod: &Pod) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let name = pod.metadata.name.clone();
        state.submitted.push(name.clone());
        if let Some(err) = state.submit_failures.get(&name) {
            return Err(err.clone());
        }
        let key = (pod.metadata.namespace.clone(), name.clone());
        if state.units.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(name));
        }
        state
            .units
            .insert(key, (pod.clone(), PodStatus::new(PodPhase::Pending)));
        Ok(())
    }

    fn status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .units
            .get(&(namespace.to_string(), name.to_string()))
            .map(|(_, status)| status.clone()))
    }

    fn terminate(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.terminated.push(name.to_string());
        if let Some(err) = state.terminate_failures.get(name) {
            return Err(err.clone());
        }
        match state.units.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(unit) => {
                unit.1 = PodStatus::new(PodPhase::Failed).with_message("terminated");
                Ok(())
            }
            None => Err(ClusterError::NotFound(name.to_string())),
        }
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(name.to_string());
        if let Some(err) = state.delete_failures.get(name) {
            return Err(err.clone());
        }
        state
            .units
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }
}

/// Events sink that keeps every event and can be told to fail.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<PhaseInfo>>,
    failing: Mutex<bool>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn events(&self) -> Vec<PhaseInfo> {
        self.events.lock().unwrap().clone()
    }
}

impl EventsRecorder for RecordingEvents {
    fn record_raw(&self, event: &PhaseInfo) -> Result<(), EventError> {
        if *self.failing.lock().unwrap() {
            return Err(EventError::Unavailable("sink down".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
