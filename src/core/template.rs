//! Task Template Model
//!
//! The immutable task description handed to the plugin by the engine, and
//! the readers that supply it.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id:
//!   project: flytesnacks
//!   domain: development
//!   name: map_square
//!   version: v1
//! taskTypeVersion: 1
//! config:
//!   primary_container_name: main
//! metadata:
//!   discoverable: true
//!   discoveryVersion: "1"
//! target:
//!   metadata:
//!     labels:
//!       team: genomics
//!   podSpec:
//!     containers:
//!       - name: main
//!         image: busybox
//!         command: ["sh", "-c", "echo {{.input}} > {{.outputPrefix}}/out"]
//! custom:
//!   size: 10
//!   parallelism: 4
//!   minSuccessRatio: 0.9
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::error::PluginError;

/// Identity of a task definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TaskIdentifier {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Engine-level task settings the plugin honours.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Whether results may be served from the result cache
    #[serde(default)]
    pub discoverable: bool,

    /// Cache namespace; bumping it invalidates earlier results
    #[serde(default)]
    pub discovery_version: String,
}

/// Labels and annotations carried by a template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct K8sObjectMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Work-unit target of a pod-shaped task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodTarget {
    /// Structured pod specification document
    #[serde(default)]
    pub pod_spec: Option<Value>,

    #[serde(default)]
    pub metadata: K8sObjectMetadata,
}

/// Immutable description of one task, created once per execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    #[serde(default)]
    pub id: TaskIdentifier,

    #[serde(default)]
    pub task_type_version: i32,

    #[serde(default)]
    pub config: BTreeMap<String, String>,

    #[serde(default)]
    pub metadata: TaskMetadata,

    #[serde(default)]
    pub target: Option<PodTarget>,

    /// Plugin-specific payload
    #[serde(default)]
    pub custom: Option<Value>,
}

impl TaskTemplate {
    /// Returns the embedded work-unit spec, if any.
    pub fn pod_spec(&self) -> Option<&Value> {
        self.target
            .as_ref()
            .and_then(|t| t.pod_spec.as_ref())
            .filter(|v| !v.is_null())
    }

    /// Returns the template-level labels and annotations.
    pub fn object_metadata(&self) -> Option<&K8sObjectMetadata> {
        self.target.as_ref().map(|t| &t.metadata)
    }

    /// Decodes the custom payload into a plugin-specific type.
    pub fn decode_custom<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        let custom = self
            .custom
            .as_ref()
            .ok_or_else(|| PluginError::bad_spec("missing custom payload for task"))?;

        serde_json::from_value(custom.clone()).map_err(|e| {
            PluginError::bad_spec(format!(
                "Unable to unmarshal task custom [{}], Err: [{}]",
                custom, e
            ))
        })
    }
}

/// Array job descriptor carried in a template's custom payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArrayJob {
    /// Number of children
    pub size: i64,

    /// Maximum number of children active at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i64>,

    /// Minimum number of children that must succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_successes: Option<i64>,

    /// Minimum fraction of children that must succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_success_ratio: Option<f64>,
}

impl ArrayJob {
    pub fn new(size: i64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Number of successes required for the array job to count as done.
    ///
    /// An explicit `min_successes` wins over `min_success_ratio`; without
    /// either, every child must succeed.
    pub fn required_successes(&self) -> usize {
        let size = self.size.max(0) as usize;
        let required = match (self.min_successes, self.min_success_ratio) {
            (Some(n), _) => n.max(0) as usize,
            (None, Some(ratio)) => (size as f64 * ratio.clamp(0.0, 1.0)).ceil() as usize,
            (None, None) => size,
        };
        required.min(size)
    }

    /// Number of failed children tolerated before the job fails.
    pub fn failure_threshold(&self) -> usize {
        (self.size.max(0) as usize) - self.required_successes()
    }
}

/// Errors while loading a template file.
#[derive(Debug, Error)]
pub enum TemplateLoadError {
    #[error("failed to read task template '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task template '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Loads a task template from a YAML (or JSON) file.
pub fn load_template(path: impl AsRef<Path>) -> Result<TaskTemplate, TemplateLoadError> {
    let path = path.as_ref();
    info!("Loading task template from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| TemplateLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    debug!("Template content loaded ({} bytes)", content.len());

    // YAML is a superset of JSON, so both formats go through serde_yaml
    let template: TaskTemplate =
        serde_yaml::from_str(&content).map_err(|source| TemplateLoadError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    info!(
        "Parsed template '{}' (type version {})",
        template.id.name, template.task_type_version
    );
    Ok(template)
}

/// Supplies the task template for the current execution.
pub trait TaskReader: Send + Sync {
    /// Returns the template; fails if it is unavailable or malformed.
    fn read(&self) -> Result<TaskTemplate, PluginError>;
}

/// Reader serving a template held in memory.
#[derive(Debug, Clone)]
pub struct StaticTaskReader {
    template: TaskTemplate,
}

impl StaticTaskReader {
    pub fn new(template: TaskTemplate) -> Self {
        Self { template }
    }
}

impl TaskReader for StaticTaskReader {
    fn read(&self) -> Result<TaskTemplate, PluginError> {
        Ok(self.template.clone())
    }
}

/// Reader loading the template from a file on every call.
#[derive(Debug, Clone)]
pub struct FileTaskReader {
    path: PathBuf,
}

impl FileTaskReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TaskReader for FileTaskReader {
    fn read(&self) -> Result<TaskTemplate, PluginError> {
        load_template(&self.path).map_err(|e| PluginError::bad_spec(e.to_string()))
    }
}
