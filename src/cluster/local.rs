//! Local Process Cluster
//!
//! Runs each submitted unit's primary container as a local process. Useful
//! for running array tasks on a single machine and for exercising the
//! controller end to end:
//! - Command and args of the primary container form the process argv
//! - Container env vars are passed through
//! - Output of each unit goes to `<unit_dir>/<unit>.log`
//!
//! Every unit also leaves a `<unit>.pid` record, and a small shell wrapper
//! writes the exit code to `<unit>.exit` when the process ends. A new
//! `LocalCluster` over the same directory re-attaches to those units, so a
//! restarted run keeps tracking children started before the restart.

use std::collections::HashMap;
use std::env;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};

use super::pod::{Pod, PodPhase, PodStatus};
use super::{Cluster, ClusterError};

type UnitKey = (String, String);

/// Env var telling the wrapper where to record the exit code.
const EXIT_FILE_VAR: &str = "ARRAYRUNNER_EXIT_FILE";

/// Runs the unit's argv, then records its exit code atomically.
const WRAPPER_SCRIPT: &str = r#""$@"; code=$?; echo "$code" > "$ARRAYRUNNER_EXIT_FILE.tmp" && mv "$ARRAYRUNNER_EXIT_FILE.tmp" "$ARRAYRUNNER_EXIT_FILE"; exit "$code""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Code(i32),
    /// Killed before the wrapper could record a code
    Signal,
    /// Gone without a recorded code
    Lost,
}

struct LocalUnit {
    pid: u32,
    /// `None` for units re-attached from their pid record
    child: Option<Child>,
    exit: Option<Exit>,
    terminated: bool,
}

impl LocalUnit {
    fn spawned(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            exit: None,
            terminated: false,
        }
    }

    fn adopted(pid: u32) -> Self {
        Self {
            pid,
            child: None,
            exit: None,
            terminated: false,
        }
    }

    fn refresh(&mut self, exit_path: &Path) -> Result<(), ClusterError> {
        if self.exit.is_some() {
            return Ok(());
        }

        match self.child.as_mut() {
            Some(child) => {
                let status = child
                    .try_wait()
                    .map_err(|e| ClusterError::Transient(format!("wait failed: {}", e)))?;
                self.exit = status.map(|s| s.code().map_or(Exit::Signal, Exit::Code));
            }
            None => {
                self.exit = read_exit_code(exit_path)?.map(Exit::Code);
                if self.exit.is_none() && !process_alive(self.pid) {
                    // The wrapper records the code before it exits
                    self.exit = Some(read_exit_code(exit_path)?.map_or(Exit::Lost, Exit::Code));
                }
            }
        }
        Ok(())
    }

    fn status(&self) -> PodStatus {
        match self.exit {
            None => PodStatus::new(PodPhase::Running),
            Some(Exit::Code(0)) => PodStatus::new(PodPhase::Succeeded),
            Some(_) if self.terminated => {
                PodStatus::new(PodPhase::Failed).with_message("terminated on request")
            }
            Some(Exit::Code(code)) => PodStatus::new(PodPhase::Failed)
                .with_message(format!("process exited with code: {}", code)),
            Some(Exit::Signal) => PodStatus::new(PodPhase::Failed).with_message("process killed by signal"),
            Some(Exit::Lost) => PodStatus::new(PodPhase::Failed)
                .with_message("process exited without recording a status"),
        }
    }

    /// Kills the unit's whole process group.
    fn kill(&mut self) -> Result<(), ClusterError> {
        let killed = Command::new("sh")
            .args(["-c", r#"kill -s KILL -- "-$1""#, "sh"])
            .arg(self.pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ClusterError::Transient(format!("kill failed: {}", e)))?;

        if !killed.success() && process_alive(self.pid) {
            return Err(ClusterError::Transient(format!(
                "could not kill process group {}",
                self.pid
            )));
        }
        self.terminated = true;
        if self.child.is_none() {
            self.exit = Some(Exit::Signal);
        }
        Ok(())
    }
}

/// Cluster backend running units as local processes.
pub struct LocalCluster {
    working_dir: Option<PathBuf>,
    unit_dir: PathBuf,
    units: Mutex<HashMap<UnitKey, LocalUnit>>,
}

impl LocalCluster {
    /// Creates a local cluster keeping unit logs and records under `unit_dir`.
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: None,
            unit_dir: unit_dir.into(),
            units: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the working directory processes start in.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Returns the log file path for a unit.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.log", name))
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.pid", name))
    }

    fn exit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.exit", name))
    }

    fn units(&self) -> Result<MutexGuard<'_, HashMap<UnitKey, LocalUnit>>, ClusterError> {
        self.units
            .lock()
            .map_err(|_| ClusterError::Transient("unit table lock poisoned".to_string()))
    }

    /// Ensures a unit started by an earlier instance is in the table.
    ///
    /// Returns whether the unit is known.
    fn attach(&self, units: &mut HashMap<UnitKey, LocalUnit>, key: &UnitKey) -> Result<bool, ClusterError> {
        if units.contains_key(key) {
            return Ok(true);
        }

        let path = self.pid_path(&key.1);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(ClusterError::Transient(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let Ok(pid) = content.trim().parse::<u32>() else {
            warn!("Ignoring malformed pid record {}", path.display());
            return Ok(false);
        };

        info!("Re-attached to unit '{}' (pid {})", key.1, pid);
        units.insert(key.clone(), LocalUnit::adopted(pid));
        Ok(true)
    }

    fn spawn(&self, pod: &Pod) -> Result<Child, ClusterError> {
        let name = &pod.metadata.name;
        let container = pod
            .primary_container()
            .or_else(|| pod.spec.containers.first())
            .ok_or_else(|| ClusterError::Rejected(format!("unit '{}' has no containers", name)))?;

        let argv: Vec<&String> = container.command.iter().chain(&container.args).collect();
        let Some(program) = argv.first() else {
            return Err(ClusterError::Rejected(format!(
                "container '{}' of unit '{}' has no command",
                container.name, name
            )));
        };
        if !self.program_exists(program) {
            return Err(ClusterError::Rejected(format!("cannot start '{}': program not found", program)));
        }

        fs::create_dir_all(&self.unit_dir)
            .map_err(|e| ClusterError::Transient(format!("cannot create unit dir: {}", e)))?;
        let exit_path = self.exit_path(name);
        remove_if_present(&exit_path)?;

        let log = File::create(self.log_path(name))
            .map_err(|e| ClusterError::Transient(format!("cannot create log file: {}", e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| ClusterError::Transient(format!("cannot clone log handle: {}", e)))?;

        let mut cmd = Command::new("sh");
        cmd.args(["-c", WRAPPER_SCRIPT, "arrayrunner-unit"])
            .args(argv.iter().map(|a| a.as_str()))
            .envs(container.env.iter().map(|e| (e.name.as_str(), e.value.as_str())))
            .env(EXIT_FILE_VAR, &exit_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Starting unit '{}' in {}", name, dir.display());
        }

        let child = cmd
            .spawn()
            .map_err(|e| ClusterError::Transient(format!("cannot start '{}': {}", program, e)))?;

        fs::write(self.pid_path(name), child.id().to_string())
            .map_err(|e| ClusterError::Transient(format!("cannot record pid of '{}': {}", name, e)))?;
        Ok(child)
    }

    /// Resolves `program` the way the shell will.
    fn program_exists(&self, program: &str) -> bool {
        if program.contains('/') {
            let path = Path::new(program);
            return match (&self.working_dir, path.is_relative()) {
                (Some(dir), true) => dir.join(path).is_file(),
                _ => path.is_file(),
            };
        }

        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }
}

impl Cluster for LocalCluster {
    fn submit(&self, pod: &Pod) -> Result<(), ClusterError> {
        let key = (pod.metadata.namespace.clone(), pod.metadata.name.clone());
        let mut units = self.units()?;
        if self.attach(&mut units, &key)? {
            return Err(ClusterError::AlreadyExists(pod.metadata.name.clone()));
        }

        let child = self.spawn(pod)?;
        debug!("Unit '{}' started as pid {}", pod.metadata.name, child.id());
        units.insert(key, LocalUnit::spawned(child));
        Ok(())
    }

    fn status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>, ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        let mut units = self.units()?;
        if !self.attach(&mut units, &key)? {
            return Ok(None);
        }
        let Some(unit) = units.get_mut(&key) else {
            return Ok(None);
        };
        unit.refresh(&self.exit_path(name))?;
        Ok(Some(unit.status()))
    }

    fn terminate(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        let mut units = self.units()?;
        self.attach(&mut units, &key)?;
        let unit = units
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;

        unit.refresh(&self.exit_path(name))?;
        if unit.exit.is_some() {
            return Ok(());
        }
        unit.kill()
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        let mut unit = {
            let mut units = self.units()?;
            self.attach(&mut units, &key)?;
            units
                .remove(&key)
                .ok_or_else(|| ClusterError::NotFound(name.to_string()))?
        };

        unit.refresh(&self.exit_path(name))?;
        if unit.exit.is_none() {
            if let Err(e) = unit.kill() {
                warn!("Failed to kill unit '{}' during delete: {}", name, e);
            }
        }
        if let Some(child) = unit.child.as_mut() {
            // Reap so the process table entry goes away
            let _ = child.wait();
        }

        remove_if_present(&self.pid_path(name))?;
        remove_if_present(&self.exit_path(name))?;
        debug!("Deleted unit '{}'", name);
        Ok(())
    }
}

fn read_exit_code(path: &Path) -> Result<Option<i32>, ClusterError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().parse().unwrap_or(-1))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClusterError::Transient(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn remove_if_present(path: &Path) -> Result<(), ClusterError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClusterError::Transient(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}

fn process_alive(pid: u32) -> bool {
    Command::new("sh")
        .args(["-c", r#"kill -0 "$1" 2>/dev/null"#, "sh"])
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
