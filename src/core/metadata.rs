//! Task Execution Metadata
//!
//! Read-only facts about the current execution, supplied fresh every round.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::OwnerReference;

/// Identity an execution runs as.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_service_account: Option<String>,
}

/// Security settings of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    #[serde(default)]
    pub run_as: Identity,
}

/// Execution metadata of one task attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionMetadata {
    /// Unique, cluster-safe name of this execution; children derive theirs from it
    pub generated_name: String,

    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub owner_reference: OwnerReference,

    #[serde(default)]
    pub security_context: SecurityContext,

    /// Service account granting cluster access to the units
    #[serde(default)]
    pub k8s_service_account: String,
}

impl TaskExecutionMetadata {
    pub fn new(generated_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            generated_name: generated_name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Service account units should run as.
    ///
    /// The security context's identity takes priority over the plain field.
    pub fn service_account(&self) -> Option<&str> {
        self.security_context
            .run_as
            .k8s_service_account
            .as_deref()
            .or(Some(self.k8s_service_account.as_str()))
            .filter(|sa| !sa.is_empty())
    }
}
