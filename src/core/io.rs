//! Input, Output and Secret Handles
//!
//! The plugin never reads task data itself; it only passes locations
//! through to the units it launches. Secrets are looked up by name.

use std::collections::HashMap;
use std::env;

use thiserror::Error;

/// Location of a task's inputs.
pub trait InputReader: Send + Sync {
    /// Prefix under which all inputs live.
    fn input_prefix(&self) -> String;

    /// Full path of the serialized inputs.
    fn input_path(&self) -> String;
}

/// Location a task writes its outputs to.
pub trait OutputWriter: Send + Sync {
    /// Prefix under which outputs are written.
    fn output_prefix(&self) -> String;

    /// Prefix for raw, offloaded output data.
    fn raw_output_prefix(&self) -> String;
}

/// Input and output locations rooted at fixed prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathIo {
    input_prefix: String,
    output_prefix: String,
    raw_output_prefix: String,
}

impl PathIo {
    /// Inputs live at `{input_prefix}/inputs.pb`.
    pub fn new(input_prefix: impl Into<String>, output_prefix: impl Into<String>) -> Self {
        let output_prefix = output_prefix.into();
        Self {
            input_prefix: input_prefix.into(),
            raw_output_prefix: format!("{}/raw", output_prefix.trim_end_matches('/')),
            output_prefix,
        }
    }

    pub fn with_raw_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.raw_output_prefix = prefix.into();
        self
    }
}

impl InputReader for PathIo {
    fn input_prefix(&self) -> String {
        self.input_prefix.clone()
    }

    fn input_path(&self) -> String {
        format!("{}/inputs.pb", self.input_prefix.trim_end_matches('/'))
    }
}

impl OutputWriter for PathIo {
    fn output_prefix(&self) -> String {
        self.output_prefix.clone()
    }

    fn raw_output_prefix(&self) -> String {
        self.raw_output_prefix.clone()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),
}

/// Looks up secrets configured for the plugin.
pub trait SecretManager: Send + Sync {
    fn get(&self, name: &str) -> Result<String, SecretError>;
}

/// Secrets read from environment variables named `{prefix}{NAME}`.
#[derive(Debug, Clone)]
pub struct EnvSecretManager {
    prefix: String,
}

impl EnvSecretManager {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

impl SecretManager for EnvSecretManager {
    fn get(&self, name: &str) -> Result<String, SecretError> {
        env::var(self.var_name(name)).map_err(|_| SecretError::NotFound(name.to_string()))
    }
}

/// Secrets held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretManager for StaticSecrets {
    fn get(&self, name: &str) -> Result<String, SecretError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}
