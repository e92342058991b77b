//! Work-Unit Template Builder
//!
//! Derives the pod each child runs from the immutable task template and the
//! execution metadata. Building is pure: identical inputs give identical
//! pods, and the template itself is never modified.
//!
//! Derivation happens in two layers:
//! - [`build_pod_map_task`]: template -> pod shared by all children
//! - [`build_child_pod`]: shared pod -> the unit of one child index

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::cluster::pod::{Pod, PodSpec, RestartPolicy, PRIMARY_CONTAINER_KEY};
use crate::core::error::{ErrorCode, PluginError};
use crate::core::io::{InputReader, OutputWriter};
use crate::core::metadata::TaskExecutionMetadata;
use crate::core::template::{ArrayJob, TaskTemplate};

use super::config::{Config, MetadataPrecedence};

/// Annotation keeping the cluster autoscaler from evicting a unit.
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// Env var naming the variable that carries the child index.
pub const JOB_INDEX_VAR_NAME: &str = "BATCH_JOB_ARRAY_INDEX_VAR_NAME";

/// Env var carrying the child index.
pub const ARRAY_INDEX_VAR_NAME: &str = "FLYTE_K8S_ARRAY_INDEX";

/// Highest task type version this plugin understands.
pub const MAX_TASK_TYPE_VERSION: i32 = 2;

/// Builds the pod shared by all children of a pod-shaped task.
///
/// Fails with `BadTaskSpecification` when the template has no pod spec or
/// its config lacks `primary_container_name`. The returned pod:
/// - has restart policy `Never`; retries belong to the controller
/// - carries the union of execution and template labels/annotations, plus
///   a `primary_container_name` annotation
/// - takes namespace and owner reference from the execution metadata
/// - has the configured scheduler, node selector and tolerations applied
pub fn build_pod_map_task(
    template: &TaskTemplate,
    metadata: &TaskExecutionMetadata,
    config: &Config,
) -> Result<Pod, PluginError> {
    let raw_spec = template
        .pod_spec()
        .ok_or_else(|| PluginError::bad_spec("missing work-unit spec for task"))?;

    let primary = template.config.get(PRIMARY_CONTAINER_KEY).ok_or_else(|| {
        PluginError::bad_spec(format!(
            "invalid TaskSpecification, config missing [{}] key in [{:?}]",
            PRIMARY_CONTAINER_KEY, template.config
        ))
    })?;

    // Deserializing from a clone leaves the template's document untouched
    let mut spec: PodSpec = serde_json::from_value(raw_spec.clone()).map_err(|e| {
        PluginError::new(
            ErrorCode::PodTemplateFailed,
            format!("unable to unmarshal pod spec [{}], Err: [{}]", raw_spec, e),
        )
    })?;

    if !spec.containers.iter().any(|c| &c.name == primary) {
        warn!("Primary container [{}] is not among the pod's containers", primary);
    }

    spec.restart_policy = Some(RestartPolicy::Never);

    let (template_labels, template_annotations) = template
        .object_metadata()
        .map(|m| (m.labels.clone(), m.annotations.clone()))
        .unwrap_or_default();

    let mut pod = Pod::default();
    pod.metadata.namespace = metadata.namespace.clone();
    pod.metadata.owner_references = vec![metadata.owner_reference.clone()];
    pod.metadata.labels = union_maps(
        &metadata.labels,
        &template_labels,
        config.metadata_precedence,
    );
    pod.metadata.annotations = union_maps(
        &metadata.annotations,
        &template_annotations,
        config.metadata_precedence,
    );
    pod.metadata
        .annotations
        .insert(PRIMARY_CONTAINER_KEY.to_string(), primary.clone());
    pod.spec = spec;

    apply_pod_policies(config, &mut pod);
    apply_node_selector(config, &mut pod);
    apply_tolerations(config, &mut pod);

    Ok(pod)
}

/// Array-job entry point: validates the descriptor and builds the shared pod.
///
/// On top of [`build_pod_map_task`], the pod is marked not safe to evict
/// and runs as the execution's service account unless the spec names one.
pub fn array_job_to_pod_template(
    template: &TaskTemplate,
    metadata: &TaskExecutionMetadata,
    config: &Config,
) -> Result<(Pod, ArrayJob), PluginError> {
    let job = array_job_from_template(template, config)?;

    let mut pod = build_pod_map_task(template, metadata, config)?;
    pod.metadata
        .annotations
        .insert(SAFE_TO_EVICT_ANNOTATION.to_string(), "false".to_string());

    if pod.spec.service_account_name.is_none() {
        pod.spec.service_account_name = metadata.service_account().map(str::to_string);
    }

    Ok((pod, job))
}

/// Reads and validates the array job descriptor of a template.
pub fn array_job_from_template(
    template: &TaskTemplate,
    config: &Config,
) -> Result<ArrayJob, PluginError> {
    if !(0..=MAX_TASK_TYPE_VERSION).contains(&template.task_type_version) {
        return Err(PluginError::new(
            ErrorCode::GetTaskTypeVersionFailed,
            format!(
                "unsupported task type version [{}], expected 0..={}",
                template.task_type_version, MAX_TASK_TYPE_VERSION
            ),
        ));
    }

    let job: ArrayJob = template.decode_custom()?;
    if job.size < 0 {
        return Err(PluginError::bad_spec(format!(
            "array job size must not be negative, got [{}]",
            job.size
        )));
    }
    if job.size as usize > config.max_array_job_size {
        return Err(PluginError::bad_spec(format!(
            "array job size [{}] exceeds the maximum allowed [{}]",
            job.size, config.max_array_job_size
        )));
    }
    Ok(job)
}

/// Name of a child unit; retries get the attempt appended.
pub fn format_sub_task_name(parent_name: &str, index: usize, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}-{}", parent_name, index)
    } else {
        format!("{}-{}-{}", parent_name, index, attempt)
    }
}

/// Values substituted into container command placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVars {
    pub input: String,
    pub input_prefix: String,
    pub output_prefix: String,
    pub raw_output_prefix: String,
}

impl CommandVars {
    /// Placeholder values for one child; outputs go to `{prefix}/{index}`.
    pub fn for_child(inputs: &dyn InputReader, outputs: &dyn OutputWriter, index: usize) -> Self {
        Self {
            input: inputs.input_path(),
            input_prefix: inputs.input_prefix(),
            output_prefix: format!("{}/{}", outputs.output_prefix().trim_end_matches('/'), index),
            raw_output_prefix: outputs.raw_output_prefix(),
        }
    }
}

/// Derives the unit of one child from the shared pod.
pub fn build_child_pod(
    shared: &Pod,
    parent_name: &str,
    index: usize,
    attempt: u32,
    vars: &CommandVars,
) -> Result<Pod, PluginError> {
    let mut pod = shared.clone();
    pod.metadata.name = format_sub_task_name(parent_name, index, attempt);

    for container in &mut pod.spec.containers {
        container.command = substitute_all(&container.command, vars)?;
        container.args = substitute_all(&container.args, vars)?;
        container.set_env(JOB_INDEX_VAR_NAME, ARRAY_INDEX_VAR_NAME);
        container.set_env(ARRAY_INDEX_VAR_NAME, index.to_string());
    }

    debug!("Built unit '{}' for child {}", pod.metadata.name, index);
    Ok(pod)
}

fn substitute_all(args: &[String], vars: &CommandVars) -> Result<Vec<String>, PluginError> {
    args.iter().map(|arg| substitute_placeholders(arg, vars)).collect()
}

/// Replaces `{{.input}}`-style placeholders in one argument.
///
/// Names are case-insensitive and may be padded with whitespace.
pub fn substitute_placeholders(arg: &str, vars: &CommandVars) -> Result<String, PluginError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            PluginError::new(
                ErrorCode::CmdTemplateFailed,
                format!("unterminated placeholder in [{}]", arg),
            )
        })?;

        let name = after[..end].trim();
        let value = match name.to_ascii_lowercase().as_str() {
            ".input" => &vars.input,
            ".inputprefix" => &vars.input_prefix,
            ".outputprefix" => &vars.output_prefix,
            ".rawoutputdataprefix" => &vars.raw_output_prefix,
            _ => {
                return Err(PluginError::new(
                    ErrorCode::CmdTemplateFailed,
                    format!("unknown placeholder [{{{{{}}}}}] in [{}]", name, arg),
                ))
            }
        };
        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Union of two maps; on shared keys the side named by `precedence` wins.
fn union_maps(
    execution: &BTreeMap<String, String>,
    template: &BTreeMap<String, String>,
    precedence: MetadataPrecedence,
) -> BTreeMap<String, String> {
    let (base, overlay) = match precedence {
        MetadataPrecedence::Template => (execution, template),
        MetadataPrecedence::Execution => (template, execution),
    };
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn apply_pod_policies(config: &Config, pod: &mut Pod) {
    if let Some(scheduler) = config.default_scheduler.as_ref().filter(|s| !s.is_empty()) {
        pod.spec.scheduler_name = Some(scheduler.clone());
    }
}

fn apply_node_selector(config: &Config, pod: &mut Pod) {
    if !config.node_selector.is_empty() {
        debug!("Applying pod node selector {:?}", config.node_selector);
        pod.spec.node_selector = config.node_selector.clone();
    }
}

fn apply_tolerations(config: &Config, pod: &mut Pod) {
    if !config.tolerations.is_empty() {
        debug!("Applying pod tolerations {:?}", config.tolerations);
        pod.spec.tolerations = config.tolerations.clone();
    }
}
