//! Array Task Round Driver
//!
//! Plays the workflow engine's part for a single array task on one machine:
//! - Calls the controller in rounds until the task reaches a terminal phase
//! - Runs children as local processes
//! - Keeps plugin state on disk so an interrupted run resumes where it stopped
//! - Honours pause and abort flag files between rounds
//! - Finalizes the task (deletes units, releases quota) once it is done

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::array::{
    array_job_to_pod_template, build_child_pod, ArrayJobController, ArrayJobState, ArrayPhase,
    Config, PhaseCounts,
};
use crate::array::transformer::CommandVars;
use crate::cluster::LocalCluster;
use crate::core::cache::InMemoryCache;
use crate::core::context::TaskExecutionContext;
use crate::core::events::TimelineRecorder;
use crate::core::io::{EnvSecretManager, PathIo};
use crate::core::metadata::TaskExecutionMetadata;
use crate::core::resource::InMemoryResourcePool;
use crate::core::state::{read_state, FileStateStore, STATE_DIR};
use crate::core::template::{load_template, FileTaskReader, TaskTemplate};

/// Interval for checking the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Default delay between rounds.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Prefix of env vars exposed through the secret manager.
const SECRET_ENV_PREFIX: &str = "ARRAYRUNNER_SECRET_";

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final aggregate phase; `None` for a dry run
    pub phase: Option<ArrayPhase>,
    pub counts: PhaseCounts,
    pub rounds: u64,
    pub elapsed: Duration,
    /// Rendered phase timeline
    pub timeline: String,
}

/// Local round driver for one array task.
///
/// # Example
///
/// ```rust,no_run
/// use arrayrunner::execution::Engine;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = Engine::new("map_square.yaml");
///     engine.set_io("/data/in", "/data/out");
///     engine.set_working_dir("/data");
///
///     let summary = engine.run()?;
///     println!("{:?}", summary.phase);
///     Ok(())
/// }
/// ```
pub struct Engine {
    template_path: PathBuf,
    config: Config,
    execution_name: Option<String>,
    namespace: String,
    input_prefix: String,
    output_prefix: String,
    state_dir: PathBuf,
    working_dir: Option<PathBuf>,
    dry_run: bool,
    fresh: bool,
    pause_flag_path: Option<PathBuf>,
    abort_flag_path: Option<PathBuf>,
    poll_interval: Duration,
    max_rounds: Option<u64>,
}

impl Engine {
    /// Creates a driver for the task template at `template_path`.
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
            config: Config::default(),
            execution_name: None,
            namespace: "default".to_string(),
            input_prefix: ".".to_string(),
            output_prefix: "outputs".to_string(),
            state_dir: PathBuf::from(STATE_DIR),
            working_dir: None,
            dry_run: false,
            fresh: false,
            pause_flag_path: None,
            abort_flag_path: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_rounds: None,
        }
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// Sets the execution name children derive their unit names from.
    ///
    /// Defaults to the template's task name; keep it stable to resume.
    pub fn set_execution_name(&mut self, name: impl Into<String>) {
        self.execution_name = Some(name.into());
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    /// Sets where inputs are read from and outputs written to.
    pub fn set_io(&mut self, input_prefix: impl Into<String>, output_prefix: impl Into<String>) {
        self.input_prefix = input_prefix.into();
        self.output_prefix = output_prefix.into();
    }

    /// Sets the directory holding state files and unit logs.
    pub fn set_state_dir(&mut self, dir: impl Into<PathBuf>) {
        self.state_dir = dir.into();
    }

    /// Sets the working directory units start in.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Discards state left by an earlier run of the same execution.
    pub fn set_fresh(&mut self, fresh: bool) {
        self.fresh = fresh;
    }

    /// Sets the path for pause/resume signaling.
    pub fn set_pause_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.pause_flag_path = Some(path.into());
    }

    /// Sets the path whose appearance aborts the task.
    pub fn set_abort_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.abort_flag_path = Some(path.into());
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Fails the run if the task is not terminal after `rounds` rounds.
    pub fn set_max_rounds(&mut self, rounds: u64) {
        self.max_rounds = Some(rounds);
    }

    /// Runs the task to completion.
    ///
    /// # Returns
    ///
    /// * `Ok(summary)` - The task reached a terminal phase (or the dry run
    ///   finished); the phase may still be `Failed`
    /// * `Err` - A round failed, or abort/finalize left units behind
    pub fn run(&mut self) -> Result<RunSummary, Box<dyn Error>> {
        let start_time = Instant::now();
        let template = load_template(&self.template_path)?;
        let metadata = self.execution_metadata(&template);

        if self.dry_run {
            return self.print_dry_run(&template, &metadata, start_time);
        }

        let store = Arc::new(FileStateStore::new(&self.state_dir, &metadata.generated_name));
        let unit_dir = self.unit_dir(&metadata.generated_name);
        if self.fresh {
            store.delete()?;
            if unit_dir.exists() {
                fs::remove_dir_all(&unit_dir)?;
                info!("Discarded unit records in {}", unit_dir.display());
            }
        }

        let mut cluster = LocalCluster::new(unit_dir);
        if let Some(dir) = &self.working_dir {
            cluster = cluster.with_working_dir(dir);
        }

        let timeline = Arc::new(TimelineRecorder::new());
        let mut ctx = TaskExecutionContext::new(
            Arc::new(FileTaskReader::new(&self.template_path)),
            metadata,
            Arc::new(PathIo::new(&self.input_prefix, &self.output_prefix)),
            store.clone(),
        )
        .with_cache(Arc::new(InMemoryCache::new()))
        .with_events(timeline.clone())
        .with_secrets(Arc::new(EnvSecretManager::new(SECRET_ENV_PREFIX)));

        if let Some(quota) = &self.config.resource_quota {
            let pool = InMemoryResourcePool::new();
            pool.register(quota.namespace.clone(), quota.capacity)?;
            ctx = ctx.with_resources(Arc::new(pool));
        }

        let controller = ArrayJobController::new(self.config.clone(), Arc::new(cluster));
        info!(
            "Running array task '{}' as '{}' ({} workers)",
            template.id.name,
            ctx.metadata.generated_name,
            self.config.workers()
        );

        let mut rounds = 0;
        let phase = loop {
            store.begin_round()?;
            rounds += 1;

            if let Some(pause_path) = &self.pause_flag_path {
                check_pause_flag(pause_path);
            }

            let phase = match controller.handle(&ctx) {
                Ok(phase) => phase,
                Err(e) => {
                    error!("Round {} failed: {}", rounds, e);
                    if !e.is_specification_error() {
                        store.begin_round()?;
                        if let Err(cleanup) = controller.terminate(&ctx) {
                            warn!("Cleanup after failed round incomplete: {}", cleanup);
                        }
                    }
                    return Err(e.into());
                }
            };

            if phase.is_terminal() {
                break phase;
            }

            if self.abort_requested() {
                warn!("Abort requested, terminating all children");
                store.begin_round()?;
                controller.terminate(&ctx)?;
                break ArrayPhase::Aborted;
            }

            if let Some(max) = self.max_rounds {
                if rounds >= max {
                    store.begin_round()?;
                    controller.terminate(&ctx)?;
                    return Err(format!("array task still {} after {} rounds", phase, rounds).into());
                }
            }

            thread::sleep(self.poll_interval);
        };

        store.begin_round()?;
        if phase != ArrayPhase::Aborted {
            controller.finalize(&ctx)?;
        }

        let counts = read_state::<ArrayJobState>(store.as_ref())?
            .map(|s| s.counts())
            .unwrap_or_default();

        Ok(RunSummary {
            phase: Some(phase),
            counts,
            rounds,
            elapsed: start_time.elapsed(),
            timeline: timeline.report(),
        })
    }

    /// Prints every child's derived unit without running anything.
    fn print_dry_run(
        &self,
        template: &TaskTemplate,
        metadata: &TaskExecutionMetadata,
        start_time: Instant,
    ) -> Result<RunSummary, Box<dyn Error>> {
        let (shared, job) = array_job_to_pod_template(template, metadata, &self.config)?;
        let io = PathIo::new(&self.input_prefix, &self.output_prefix);
        let size = job.size.max(0) as usize;

        for index in 0..size {
            let vars = CommandVars::for_child(&io, &io, index);
            let pod = build_child_pod(&shared, &metadata.generated_name, index, 0, &vars)?;
            println!();
            println!("[DRY RUN] Child {}", index);
            print!("{}", serde_yaml::to_string(&pod)?);
        }

        Ok(RunSummary {
            phase: None,
            counts: PhaseCounts {
                pending: size,
                ..PhaseCounts::default()
            },
            rounds: 0,
            elapsed: start_time.elapsed(),
            timeline: String::new(),
        })
    }

    fn execution_metadata(&self, template: &TaskTemplate) -> TaskExecutionMetadata {
        let name = self.execution_name.clone().unwrap_or_else(|| {
            let stem = self
                .template_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if template.id.name.is_empty() {
                stem
            } else {
                template.id.name.clone()
            }
        });

        TaskExecutionMetadata::new(unit_safe_name(&name), &self.namespace)
            .with_label("task-name", unit_safe_name(&template.id.name))
    }

    /// Directory holding the logs and process records of one execution.
    fn unit_dir(&self, execution_name: &str) -> PathBuf {
        self.state_dir.join("units").join(execution_name)
    }

    fn abort_requested(&self) -> bool {
        self.abort_flag_path.as_deref().is_some_and(Path::exists)
    }
}

/// Lowercases a name and maps anything outside `[a-z0-9-]` to `-`.
fn unit_safe_name(name: &str) -> String {
    let safe: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = safe.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Checks if pause flag exists and waits for it to be removed.
fn check_pause_flag(pause_path: &Path) {
    if pause_path.exists() {
        info!("Execution paused - waiting for resume signal");

        while pause_path.exists() {
            thread::sleep(PAUSE_CHECK_INTERVAL);
        }

        info!("Resumed");
    }
}
