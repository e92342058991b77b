//! Array Job Controller
//!
//! Drives all children of one array task, one round at a time. Every round:
//! 1. Reads the task template and derives the shared pod
//! 2. Loads the array state as of round start (or creates it)
//! 3. Polls children whose units are live, in parallel
//! 4. Serves cached children, then admits and submits pending ones up to
//!    the parallelism cap
//! 5. Recomputes the aggregate phase, records an event if it changed and
//!    stages the new state for the next round
//!
//! Abort and finalize visit every child, never stopping at the first
//! failure, and report all per-child failures as one bounded error.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::cluster::{Cluster, Pod};
use crate::core::cache::{CacheEntry, CacheKey};
use crate::core::context::TaskExecutionContext;
use crate::core::error::PluginError;
use crate::core::events::PhaseInfo;
use crate::core::state::{read_state, write_state};
use crate::core::template::{ArrayJob, TaskTemplate};
use crate::execution::pool::run_bounded;

use super::config::Config;
use super::errors::ErrorMessageCollector;
use super::state::{ArrayJobState, ArrayPhase, ChildPhase, ChildState};
use super::task::ChildOps;
use super::transformer::{array_job_to_pod_template, build_child_pod, CommandVars};

/// Round-driven controller for array tasks.
///
/// Holds no per-task state of its own; everything that must survive a
/// round lives in the context's state store.
pub struct ArrayJobController {
    config: Config,
    cluster: Arc<dyn Cluster>,
}

impl ArrayJobController {
    pub fn new(config: Config, cluster: Arc<dyn Cluster>) -> Self {
        Self { config, cluster }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one round and returns the aggregate phase.
    ///
    /// Template errors fail the round before any cluster call. The state is
    /// staged even when a launch fails, so progress made by the round is
    /// not lost.
    pub fn handle(&self, ctx: &TaskExecutionContext) -> Result<ArrayPhase, PluginError> {
        let template = ctx.task_reader.read()?;
        let (shared, job) = array_job_to_pod_template(&template, &ctx.metadata, &self.config)?;
        let mut state = self.load_state(ctx, &job)?;
        let previous = state.phase;
        let previous_reported = state.task_phase();

        if previous.is_terminal() {
            debug!(
                "Array job '{}' already {}, nothing to do",
                ctx.metadata.generated_name, previous
            );
            return Ok(previous);
        }

        let ops = self.child_ops(ctx);

        let active = indices_where(&state, |c| c.phase.is_active());
        let children = &state.children;
        let polled = run_bounded(&active, self.config.workers(), |i| ops.monitor(i, &children[i]));
        for (index, next) in polled {
            if next.phase == ChildPhase::Succeeded {
                self.cache_result(ctx, &template, index);
            }
            state.children[index] = next;
        }

        let launched = if state.recompute_phase() == ArrayPhase::Failed {
            Ok(())
        } else {
            self.launch_pending(ctx, &ops, &template, &shared, &job, &mut state)
        };

        let phase = state.recompute_phase();
        if phase != previous || state.task_phase() != previous_reported {
            self.record_transition(ctx, &mut state);
        }
        write_state(ctx.state_writer.as_ref(), &state)?;
        launched?;

        debug!(
            "Array job '{}' round done: {}",
            ctx.metadata.generated_name,
            state.counts()
        );
        Ok(phase)
    }

    /// Requests termination of every child's unit.
    pub fn abort(&self, ctx: &TaskExecutionContext) -> Result<(), PluginError> {
        let Some(mut state) = read_state::<ArrayJobState>(ctx.state_reader.as_ref())? else {
            info!("Array job '{}' never started, nothing to abort", ctx.metadata.generated_name);
            return Ok(());
        };

        info!("Aborting array job '{}'", ctx.metadata.generated_name);
        let ops = self.child_ops(ctx);
        let errors = self.for_each_child(&state, |i, child| ops.abort(i, child).err().into_iter().collect());

        self.mark_aborted(ctx, &mut state)?;
        self.lifecycle_result("abort", errors)
    }

    /// Deletes every child's unit and releases every admission token.
    pub fn finalize(&self, ctx: &TaskExecutionContext) -> Result<(), PluginError> {
        let Some(state) = read_state::<ArrayJobState>(ctx.state_reader.as_ref())? else {
            return Ok(());
        };

        info!("Finalizing array job '{}'", ctx.metadata.generated_name);
        let ops = self.child_ops(ctx);
        let errors =
            self.for_each_child(&state, |i, child| ops.finalize(i, child).err().into_iter().collect());
        self.lifecycle_result("finalize", errors)
    }

    /// Aborts then finalizes each child in a single pass.
    pub fn terminate(&self, ctx: &TaskExecutionContext) -> Result<(), PluginError> {
        let Some(mut state) = read_state::<ArrayJobState>(ctx.state_reader.as_ref())? else {
            return Ok(());
        };

        info!("Terminating array job '{}'", ctx.metadata.generated_name);
        let ops = self.child_ops(ctx);
        let errors = self.for_each_child(&state, |i, child| {
            [ops.abort(i, child), ops.finalize(i, child)]
                .into_iter()
                .filter_map(Result::err)
                .collect()
        });

        self.mark_aborted(ctx, &mut state)?;
        self.lifecycle_result("terminate", errors)
    }

    fn child_ops<'a>(&'a self, ctx: &'a TaskExecutionContext) -> ChildOps<'a> {
        let resources = match (&ctx.resources, &self.config.resource_quota) {
            (Some(manager), Some(quota)) => Some((manager.as_ref(), quota)),
            _ => None,
        };
        ChildOps {
            cluster: self.cluster.as_ref(),
            resources,
            namespace: &ctx.metadata.namespace,
            parent_name: &ctx.metadata.generated_name,
            max_retries: self.config.max_child_retries,
        }
    }

    fn load_state(&self, ctx: &TaskExecutionContext, job: &ArrayJob) -> Result<ArrayJobState, PluginError> {
        let size = job.size.max(0) as usize;
        match read_state::<ArrayJobState>(ctx.state_reader.as_ref())? {
            Some(state) if state.size != size || !state.is_consistent() => {
                Err(PluginError::bad_spec(format!(
                    "stored state tracks [{}] children but the array job declares [{}]",
                    state.children.len(),
                    size
                )))
            }
            Some(state) => Ok(state),
            None => {
                info!(
                    "Starting array job '{}' with {} children (tolerating {} failures)",
                    ctx.metadata.generated_name,
                    size,
                    job.failure_threshold()
                );
                Ok(ArrayJobState::new(size, job.failure_threshold()))
            }
        }
    }

    fn launch_pending(
        &self,
        ctx: &TaskExecutionContext,
        ops: &ChildOps<'_>,
        template: &TaskTemplate,
        shared: &Pod,
        job: &ArrayJob,
        state: &mut ArrayJobState,
    ) -> Result<(), PluginError> {
        self.serve_from_cache(ctx, template, state);

        let slots = match job.parallelism {
            Some(limit) if limit > 0 => (limit as usize).saturating_sub(state.counts().active),
            _ => usize::MAX,
        };
        let pending: Vec<usize> = indices_where(state, |c| c.phase.needs_launch())
            .into_iter()
            .take(slots)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut pods = BTreeMap::new();
        for &index in &pending {
            let vars = CommandVars::for_child(ctx.input_reader.as_ref(), ctx.output_writer.as_ref(), index);
            let pod = build_child_pod(shared, ops.parent_name, index, state.children[index].attempt, &vars)?;
            pods.insert(index, pod);
        }

        let children = &state.children;
        let launched = run_bounded(&pending, self.config.workers(), |i| {
            ops.launch(i, &children[i], &pods[&i])
        });

        let mut first_error = None;
        for (index, result) in launched {
            match result {
                Ok(next) => state.children[index] = next,
                Err(e) => {
                    warn!("Launching child {} failed: {}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Marks unstarted children whose result is cached as succeeded.
    fn serve_from_cache(&self, ctx: &TaskExecutionContext, template: &TaskTemplate, state: &mut ArrayJobState) {
        let Some(cache) = ctx.cache.as_ref().filter(|_| template.metadata.discoverable) else {
            return;
        };

        for index in indices_where(state, |c| c.phase == ChildPhase::NotStarted) {
            match cache.get(&cache_key(ctx, template, index)) {
                Ok(Some(entry)) => {
                    debug!("Child {} served from cache at {}", index, entry.output_path);
                    let child = &mut state.children[index];
                    child.phase = ChildPhase::Succeeded;
                    child.cached = true;
                }
                Ok(None) => {}
                Err(e) => warn!("Cache lookup for child {} failed: {}", index, e),
            }
        }
    }

    fn cache_result(&self, ctx: &TaskExecutionContext, template: &TaskTemplate, index: usize) {
        let Some(cache) = ctx.cache.as_ref().filter(|_| template.metadata.discoverable) else {
            return;
        };

        let entry = CacheEntry {
            output_path: format!(
                "{}/{}",
                ctx.output_writer.output_prefix().trim_end_matches('/'),
                index
            ),
        };
        if let Err(e) = cache.put(&cache_key(ctx, template, index), entry) {
            warn!("Caching result of child {} failed: {}", index, e);
        }
    }

    fn record_transition(&self, ctx: &TaskExecutionContext, state: &mut ArrayJobState) {
        state.version += 1;
        let counts = state.counts();
        info!(
            "Array job '{}' is now {} ({})",
            ctx.metadata.generated_name, state.phase, counts
        );

        let event = PhaseInfo::new(state.task_phase(), state.version, counts.to_string());
        if let Err(e) = ctx.events.record_raw(&event) {
            warn!("Dropping phase event v{}: {}", state.version, e);
        }
    }

    fn mark_aborted(&self, ctx: &TaskExecutionContext, state: &mut ArrayJobState) -> Result<(), PluginError> {
        if !state.phase.is_terminal() {
            state.mark_aborted();
            self.record_transition(ctx, state);
        }
        write_state(ctx.state_writer.as_ref(), state)?;
        Ok(())
    }

    fn for_each_child<F>(&self, state: &ArrayJobState, op: F) -> ErrorMessageCollector
    where
        F: Fn(usize, &ChildState) -> Vec<String> + Sync,
    {
        let indices: Vec<usize> = (0..state.children.len()).collect();
        let results = run_bounded(&indices, self.config.workers(), |i| op(i, &state.children[i]));

        let mut errors = ErrorMessageCollector::new();
        for (index, messages) in results {
            for message in messages {
                errors.collect(index, message);
            }
        }
        errors
    }

    fn lifecycle_result(&self, operation: &str, errors: ErrorMessageCollector) -> Result<(), PluginError> {
        if errors.is_empty() {
            return Ok(());
        }

        let failed = errors.indices();
        warn!("{} failed for {} children: {:?}", operation, failed.len(), failed);
        Err(PluginError::SubTasks {
            failed,
            summary: errors.summary(self.config.max_error_string_length),
        })
    }
}

fn indices_where(state: &ArrayJobState, pred: impl Fn(&ChildState) -> bool) -> Vec<usize> {
    state
        .children
        .iter()
        .enumerate()
        .filter(|(_, child)| pred(child))
        .map(|(index, _)| index)
        .collect()
}

fn cache_key(ctx: &TaskExecutionContext, template: &TaskTemplate, index: usize) -> CacheKey {
    CacheKey {
        task: template.id.clone(),
        discovery_version: template.metadata.discovery_version.clone(),
        input_path: ctx.input_reader.input_path(),
        child_index: index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::config::ResourceQuota;
    use crate::cluster::{ClusterError, PodPhase, PodStatus};
    use crate::core::cache::{CacheClient, InMemoryCache};
    use crate::core::events::Phase;
    use crate::core::io::PathIo;
    use crate::core::metadata::TaskExecutionMetadata;
    use crate::core::resource::{InMemoryResourcePool, ResourceManager, ResourceNamespace};
    use crate::core::state::RoundStateStore;
    use crate::core::template::{PodTarget, StaticTaskReader, TaskIdentifier};
    use crate::testing::{FakeCluster, RecordingEvents};
    use serde_json::json;

    fn template(custom: serde_json::Value) -> TaskTemplate {
        TaskTemplate {
            id: TaskIdentifier {
                project: "p".into(),
                domain: "d".into(),
                name: "square".into(),
                version: "v1".into(),
            },
            task_type_version: 1,
            config: [("primary_container_name".to_string(), "main".to_string())].into(),
            target: Some(PodTarget {
                pod_spec: Some(json!({
                    "containers": [{
                        "name": "main",
                        "command": ["sh", "-c", "echo {{.input}} > {{.outputPrefix}}/out"]
                    }]
                })),
                ..Default::default()
            }),
            custom: Some(custom),
            ..Default::default()
        }
    }

    struct Harness {
        cluster: Arc<FakeCluster>,
        store: Arc<RoundStateStore>,
        events: Arc<RecordingEvents>,
        ctx: TaskExecutionContext,
        controller: ArrayJobController,
    }

    impl Harness {
        fn new(template: TaskTemplate, config: Config) -> Self {
            let cluster = Arc::new(FakeCluster::new());
            let store = Arc::new(RoundStateStore::new());
            let events = RecordingEvents::new();
            let ctx = TaskExecutionContext::new(
                Arc::new(StaticTaskReader::new(template)),
                TaskExecutionMetadata::new("exec", "ns"),
                Arc::new(PathIo::new("/in", "/out")),
                store.clone(),
            )
            .with_events(events.clone());
            let controller = ArrayJobController::new(config, cluster.clone());
            Self {
                cluster,
                store,
                events,
                ctx,
                controller,
            }
        }

        fn round(&self) -> Result<ArrayPhase, PluginError> {
            self.store.begin_round().unwrap();
            self.controller.handle(&self.ctx)
        }

        /// State as the next round will see it.
        fn state(&self) -> ArrayJobState {
            self.store.begin_round().unwrap();
            read_state(self.store.as_ref()).unwrap().unwrap()
        }
    }

    fn quota(capacity: usize) -> (Arc<InMemoryResourcePool>, Config) {
        let pool = Arc::new(InMemoryResourcePool::new());
        let namespace = ResourceNamespace::new("gpu");
        pool.register(namespace.clone(), capacity).unwrap();
        let config = Config {
            resource_quota: Some(ResourceQuota {
                namespace,
                capacity,
                namespace_limit: None,
            }),
            ..Config::default()
        };
        (pool, config)
    }

    #[test]
    fn test_launches_children_then_succeeds() {
        let h = Harness::new(template(json!({"size": 3})), Config::default());

        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        assert_eq!(h.cluster.unit_count(), 3);

        let unit = h.cluster.unit("ns", "exec-1").unwrap();
        let main = &unit.spec.containers[0];
        assert_eq!(main.args, Vec::<String>::new());
        assert_eq!(main.command[2], "echo /in/inputs.pb > /out/1/out");
        assert!(main.env.iter().any(|e| e.name == "FLYTE_K8S_ARRAY_INDEX" && e.value == "1"));

        h.cluster.set_all(PodPhase::Running);
        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        assert_eq!(h.state().counts().active, 3);

        h.cluster.set_all(PodPhase::Succeeded);
        assert_eq!(h.round().unwrap(), ArrayPhase::Succeeded);

        let events = h.events.events();
        let phases: Vec<Phase> = events.iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![Phase::Running, Phase::Success]);
        assert_eq!(events[1].version, 2);

        // Terminal state is left alone
        assert_eq!(h.round().unwrap(), ArrayPhase::Succeeded);
        assert_eq!(h.cluster.submitted().len(), 3);
    }

    #[test]
    fn test_empty_array_succeeds() {
        let h = Harness::new(template(json!({"size": 0})), Config::default());
        assert_eq!(h.round().unwrap(), ArrayPhase::Succeeded);
        assert!(h.cluster.submitted().is_empty());
    }

    #[test]
    fn test_partial_failure_within_threshold() {
        let h = Harness::new(template(json!({"size": 4, "minSuccesses": 3})), Config::default());
        h.round().unwrap();

        h.cluster.set_all(PodPhase::Succeeded);
        h.cluster.set_status(
            "ns",
            "exec-2",
            PodStatus::new(PodPhase::Failed).with_message("exit 1"),
        );
        assert_eq!(h.round().unwrap(), ArrayPhase::PartiallyFailed);

        let state = h.state();
        assert_eq!(state.children[2].message.as_deref(), Some("exit 1"));
        assert_eq!(state.counts().failed, 1);
    }

    #[test]
    fn test_failure_above_threshold_stops_launching() {
        let h = Harness::new(
            template(json!({"size": 4, "parallelism": 1})),
            Config::default(),
        );
        h.round().unwrap();
        assert_eq!(h.cluster.submitted(), vec!["exec-0"]);

        h.cluster.set_status("ns", "exec-0", PodStatus::new(PodPhase::Failed));
        assert_eq!(h.round().unwrap(), ArrayPhase::Failed);
        assert_eq!(h.cluster.submitted().len(), 1);
        assert_eq!(
            h.events.events().last().unwrap().phase,
            Phase::PermanentFailure
        );
    }

    #[test]
    fn test_parallelism_caps_active_children() {
        let h = Harness::new(
            template(json!({"size": 5, "parallelism": 2})),
            Config::default(),
        );
        h.round().unwrap();
        let mut submitted = h.cluster.submitted();
        submitted.sort();
        assert_eq!(submitted, vec!["exec-0", "exec-1"]);

        // Still running: no free slots
        h.round().unwrap();
        assert_eq!(h.cluster.submitted().len(), 2);

        h.cluster.set_all(PodPhase::Succeeded);
        h.round().unwrap();
        let mut submitted = h.cluster.submitted();
        submitted.sort();
        assert_eq!(submitted, vec!["exec-0", "exec-1", "exec-2", "exec-3"]);
    }

    #[test]
    fn test_admission_denial_leaves_child_pending() {
        let (pool, config) = quota(2);
        let mut h = Harness::new(template(json!({"size": 3})), config);
        h.ctx = h.ctx.clone().with_resources(pool.clone());
        let gpu = ResourceNamespace::new("gpu");

        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        let waiting = indices_where(&h.state(), |c| c.phase == ChildPhase::WaitingForResources);
        assert_eq!(waiting.len(), 1);
        assert_eq!(h.cluster.unit_count(), 2);
        assert_eq!(pool.held(&gpu), 2);

        h.cluster.set_all(PodPhase::Succeeded);
        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        assert!(h.cluster.has_unit("ns", &format!("exec-{}", waiting[0])));
        assert_eq!(pool.held(&gpu), 1);

        h.cluster.set_all(PodPhase::Succeeded);
        assert_eq!(h.round().unwrap(), ArrayPhase::Succeeded);
        assert_eq!(pool.held(&gpu), 0);
    }

    #[test]
    fn test_fully_denied_task_reports_waiting_for_resources() {
        let (pool, config) = quota(1);
        let gpu = ResourceNamespace::new("gpu");
        pool.allocate(&gpu, "other/task/0", &Default::default()).unwrap();
        let mut h = Harness::new(template(json!({"size": 2})), config);
        h.ctx = h.ctx.clone().with_resources(pool.clone());

        assert_eq!(h.round().unwrap(), ArrayPhase::Unstarted);
        assert_eq!(h.cluster.unit_count(), 0);
        let events = h.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, Phase::WaitingForResources);

        pool.release(&gpu, "other/task/0").unwrap();
        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        assert_eq!(h.events.events().last().unwrap().phase, Phase::Running);
    }

    #[test]
    fn test_failed_child_is_retried_under_new_name() {
        let config = Config {
            max_child_retries: 1,
            ..Config::default()
        };
        let h = Harness::new(template(json!({"size": 2})), config);
        h.round().unwrap();

        h.cluster.set_status("ns", "exec-0", PodStatus::new(PodPhase::Failed));
        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        assert!(!h.cluster.has_unit("ns", "exec-0"));
        assert!(h.cluster.has_unit("ns", "exec-0-1"));
        assert_eq!(h.state().children[0].attempt, 1);

        h.cluster.set_all(PodPhase::Succeeded);
        assert_eq!(h.round().unwrap(), ArrayPhase::Succeeded);
    }

    #[test]
    fn test_rejected_submission_fails_child() {
        let h = Harness::new(template(json!({"size": 2, "minSuccesses": 1})), Config::default());
        h.cluster.fail_submit("exec-1", ClusterError::Rejected("forbidden".into()));

        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        let state = h.state();
        assert_eq!(state.children[1].phase, ChildPhase::Failed);
        assert!(state.children[1]
            .message
            .as_deref()
            .unwrap()
            .starts_with("[SUBMIT_JOB_FAILED]"));

        h.cluster.set_all(PodPhase::Succeeded);
        assert_eq!(h.round().unwrap(), ArrayPhase::PartiallyFailed);
    }

    #[test]
    fn test_cache_hit_skips_launch() {
        let mut template = template(json!({"size": 3}));
        template.metadata.discoverable = true;
        template.metadata.discovery_version = "1".into();

        let cache = Arc::new(InMemoryCache::new());
        let mut h = Harness::new(template.clone(), Config::default());
        h.ctx = h.ctx.clone().with_cache(cache.clone());
        cache
            .put(
                &cache_key(&h.ctx, &template, 1),
                CacheEntry {
                    output_path: "/old/1".into(),
                },
            )
            .unwrap();

        h.round().unwrap();
        assert!(!h.cluster.submitted().contains(&"exec-1".to_string()));
        let state = h.state();
        assert!(state.children[1].cached);
        assert_eq!(state.counts().cached, 1);

        h.cluster.set_all(PodPhase::Succeeded);
        assert_eq!(h.round().unwrap(), ArrayPhase::Succeeded);
        assert_eq!(cache.len(), 3);
        assert_eq!(
            cache.get(&cache_key(&h.ctx, &template, 2)).unwrap().unwrap().output_path,
            "/out/2"
        );
    }

    #[test]
    fn test_state_size_mismatch_is_spec_error() {
        let mut h = Harness::new(template(json!({"size": 2})), Config::default());
        h.round().unwrap();

        h.ctx.task_reader = Arc::new(StaticTaskReader::new(template(json!({"size": 3}))));
        let err = h.round().unwrap_err();
        assert!(err.is_specification_error());
    }

    #[test]
    fn test_template_errors_abort_the_round() {
        let mut bad = template(json!({"size": 2}));
        bad.target = None;
        let h = Harness::new(bad, Config::default());
        let err = h.round().unwrap_err();
        assert_eq!(
            err.to_string(),
            "[BadTaskSpecification] missing work-unit spec for task"
        );
        assert!(h.cluster.submitted().is_empty());

        let mut bad = template(json!({"size": 2}));
        bad.target.as_mut().unwrap().pod_spec = Some(json!({
            "containers": [{"name": "main", "command": ["echo", "{{.secret}}"]}]
        }));
        let h = Harness::new(bad, Config::default());
        assert_eq!(h.round().unwrap_err().code(), "CMD_TEMPLATE_FAILED");
        assert!(h.cluster.submitted().is_empty());
    }

    #[test]
    fn test_event_failures_are_not_fatal() {
        let h = Harness::new(template(json!({"size": 1})), Config::default());
        h.events.set_failing(true);
        assert_eq!(h.round().unwrap(), ArrayPhase::Running);
        assert!(h.events.events().is_empty());
        assert_eq!(h.state().version, 1);
    }

    #[test]
    fn test_terminate_attempts_every_child() {
        let h = Harness::new(template(json!({"size": 5})), Config::default());
        h.round().unwrap();
        h.store.begin_round().unwrap();

        h.cluster.fail_terminate("exec-3", ClusterError::Transient("api timeout".into()));
        h.cluster.fail_delete("exec-4", ClusterError::Transient("api timeout".into()));

        let err = h.controller.terminate(&h.ctx).unwrap_err();
        let names: Vec<String> = (0..5).map(|i| format!("exec-{}", i)).collect();
        assert_eq!(h.cluster.terminated(), names);
        assert_eq!(h.cluster.deleted(), names);

        match &err {
            PluginError::SubTasks { failed, .. } => assert_eq!(failed, &vec![3, 4]),
            other => panic!("unexpected error: {:?}", other),
        }
        let text = err.to_string();
        assert!(text.contains("3: failed to terminate unit 'exec-3'"));
        assert!(text.contains("4: failed to delete unit 'exec-4'"));
        assert!(text.len() <= h.controller.config().max_error_string_length);
        assert_eq!(err.code(), "SUBTASKS_LIFECYCLE_FAILED");
    }

    #[test]
    fn test_lifecycle_error_is_bounded() {
        let config = Config {
            max_error_string_length: 40,
            ..Config::default()
        };
        let h = Harness::new(template(json!({"size": 5})), config);
        h.round().unwrap();
        h.store.begin_round().unwrap();
        for i in 0..5 {
            h.cluster
                .fail_terminate(&format!("exec-{}", i), ClusterError::Transient("x".into()));
        }

        let err = h.controller.abort(&h.ctx).unwrap_err();
        let text = err.to_string();
        assert!(text.len() <= 40);
        assert!(text.starts_with("0: "));
        assert!(text.ends_with("[truncated]"));
    }

    #[test]
    fn test_abort_and_finalize_collect_separately() {
        let h = Harness::new(template(json!({"size": 5})), Config::default());
        h.round().unwrap();
        h.store.begin_round().unwrap();
        h.cluster.fail_terminate("exec-3", ClusterError::Transient("boom".into()));
        h.cluster.fail_delete("exec-4", ClusterError::Transient("boom".into()));

        let abort = h.controller.abort(&h.ctx).unwrap_err();
        assert!(matches!(&abort, PluginError::SubTasks { failed, .. } if failed == &vec![3]));
        assert_eq!(h.cluster.terminated().len(), 5);

        let finalize = h.controller.finalize(&h.ctx).unwrap_err();
        assert!(matches!(&finalize, PluginError::SubTasks { failed, .. } if failed == &vec![4]));
        assert_eq!(h.cluster.deleted().len(), 5);
        assert_eq!(h.cluster.unit_count(), 1);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (pool, config) = quota(5);
        let mut h = Harness::new(template(json!({"size": 3})), config);
        h.ctx = h.ctx.clone().with_resources(pool.clone());
        let gpu = ResourceNamespace::new("gpu");

        h.round().unwrap();
        assert_eq!(pool.held(&gpu), 3);

        h.store.begin_round().unwrap();
        h.cluster.fail_terminate("exec-1", ClusterError::Transient("busy".into()));
        assert!(h.controller.abort(&h.ctx).is_err());
        assert_eq!(pool.held(&gpu), 1);

        h.cluster.heal();
        h.store.begin_round().unwrap();
        h.controller.abort(&h.ctx).unwrap();
        h.controller.abort(&h.ctx).unwrap();
        assert_eq!(pool.held(&gpu), 0);

        h.controller.finalize(&h.ctx).unwrap();
        h.controller.finalize(&h.ctx).unwrap();
        assert_eq!(h.cluster.unit_count(), 0);

        assert_eq!(h.state().phase, ArrayPhase::Aborted);
        assert_eq!(h.round().unwrap(), ArrayPhase::Aborted);
        let aborted = h
            .events
            .events()
            .iter()
            .filter(|e| e.phase == Phase::Aborted)
            .count();
        assert_eq!(aborted, 1);
    }

    #[test]
    fn test_lifecycle_without_state_is_noop() {
        let h = Harness::new(template(json!({"size": 3})), Config::default());
        h.store.begin_round().unwrap();
        h.controller.abort(&h.ctx).unwrap();
        h.controller.finalize(&h.ctx).unwrap();
        h.controller.terminate(&h.ctx).unwrap();
        assert!(h.cluster.terminated().is_empty());
    }
}
