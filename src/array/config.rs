//! Array Plugin Configuration
//!
//! Operator settings consumed by the template builder and the controller.
//! Loaded from YAML; every field has a default.
//!
//! ```yaml
//! default_scheduler: batch-scheduler
//! node_selector:
//!   pool: spot
//! tolerations:
//!   - key: spot
//!     operator: Exists
//!     effect: NoSchedule
//! max_error_string_length: 1000
//! max_child_retries: 2
//! resource_quota:
//!   namespace: gpu
//!   capacity: 8
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::Toleration;
use crate::core::resource::ResourceNamespace;

/// Env var naming the config file to load when none is given.
pub const CONFIG_ENV_VAR: &str = "ARRAYRUNNER_CONFIG";

/// Lazily-resolved path of the default config file.
///
/// `$ARRAYRUNNER_CONFIG` if set, else `arrayrunner.yaml` next to the
/// executable if present, else `arrayrunner.yaml` in the current directory.
pub static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        debug!("Using config from ${}: {}", CONFIG_ENV_VAR, path);
        return PathBuf::from(path);
    }

    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        let bundled = exe_dir.join("arrayrunner.yaml");
        if bundled.exists() {
            debug!("Using bundled config: {}", bundled.display());
            return bundled;
        }
    }

    PathBuf::from("arrayrunner.yaml")
});

/// Which side wins when execution metadata and the template set the same
/// label or annotation key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPrecedence {
    /// Template values overwrite execution-metadata values
    #[default]
    Template,
    /// Execution-metadata values overwrite template values
    Execution,
}

/// Admission-control pool children must claim a slot in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuota {
    pub namespace: ResourceNamespace,
    pub capacity: usize,
    /// Maximum slots held by all tasks of one execution namespace
    #[serde(default)]
    pub namespace_limit: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Scheduler assigned to every unit when set
    pub default_scheduler: Option<String>,
    /// Replaces the unit's node selector when non-empty
    pub node_selector: BTreeMap<String, String>,
    /// Replaces the unit's tolerations when non-empty
    pub tolerations: Vec<Toleration>,
    pub max_error_string_length: usize,
    pub max_array_job_size: usize,
    /// Relaunches allowed per child after its unit fails
    pub max_child_retries: u32,
    /// Worker threads for per-child operations; 0 uses one per CPU
    pub parallelism: usize,
    pub metadata_precedence: MetadataPrecedence,
    pub resource_quota: Option<ResourceQuota>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_scheduler: None,
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            max_error_string_length: 1000,
            max_array_job_size: 5000,
            max_child_retries: 0,
            parallelism: 0,
            metadata_precedence: MetadataPrecedence::default(),
            resource_quota: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads and validates a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;

        info!("Loaded plugin config from {}", path.display());
        Ok(config)
    }

    /// Loads the default config file, falling back to defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = DEFAULT_CONFIG_PATH.as_path();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Rejects settings the controller cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_array_job_size == 0 {
            return Err(ConfigError::Invalid(
                "max_array_job_size must be positive".to_string(),
            ));
        }
        if let Some(quota) = &self.resource_quota {
            if quota.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "resource pool '{}' has zero capacity",
                    quota.namespace
                )));
            }
        }
        Ok(())
    }

    /// Effective worker count for per-child operations.
    pub fn workers(&self) -> usize {
        if self.parallelism == 0 {
            num_cpus::get().max(1)
        } else {
            self.parallelism
        }
    }
}
