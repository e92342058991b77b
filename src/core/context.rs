//! Task Execution Context
//!
//! Everything one plugin invocation receives. The context is only a bundle
//! of narrow capability handles; each consumer takes just the handles it
//! needs, so tests can fake exactly those.

use std::sync::Arc;

use super::cache::CacheClient;
use super::events::{EventsRecorder, TimelineRecorder};
use super::io::{InputReader, OutputWriter, SecretManager, StaticSecrets};
use super::metadata::TaskExecutionMetadata;
use super::resource::ResourceManager;
use super::state::{PluginStateReader, PluginStateWriter};
use super::template::TaskReader;

/// Capability handles for one task execution.
#[derive(Clone)]
pub struct TaskExecutionContext {
    pub task_reader: Arc<dyn TaskReader>,
    pub metadata: TaskExecutionMetadata,
    pub input_reader: Arc<dyn InputReader>,
    pub output_writer: Arc<dyn OutputWriter>,
    pub state_reader: Arc<dyn PluginStateReader>,
    pub state_writer: Arc<dyn PluginStateWriter>,
    /// Admission control; `None` admits every child
    pub resources: Option<Arc<dyn ResourceManager>>,
    /// Result cache; `None` disables cache lookups
    pub cache: Option<Arc<dyn CacheClient>>,
    pub events: Arc<dyn EventsRecorder>,
    pub secrets: Arc<dyn SecretManager>,
}

impl TaskExecutionContext {
    /// Creates a context from the required handles.
    ///
    /// Events go to a fresh [`TimelineRecorder`] and no secrets are
    /// available until replaced with the `with_*` methods.
    pub fn new<IO, S>(
        task_reader: Arc<dyn TaskReader>,
        metadata: TaskExecutionMetadata,
        io: Arc<IO>,
        state: Arc<S>,
    ) -> Self
    where
        IO: InputReader + OutputWriter + 'static,
        S: PluginStateReader + PluginStateWriter + 'static,
    {
        Self {
            task_reader,
            metadata,
            input_reader: io.clone(),
            output_writer: io,
            state_reader: state.clone(),
            state_writer: state,
            resources: None,
            cache: None,
            events: Arc::new(TimelineRecorder::new()),
            secrets: Arc::new(StaticSecrets::default()),
        }
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheClient>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventsRecorder>) -> Self {
        self.events = events;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretManager>) -> Self {
        self.secrets = secrets;
        self
    }
}
