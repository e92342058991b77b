//! Plugin Machinery Module
//!
//! Task-agnostic building blocks every plugin invocation relies on.
//!
//! # Structure
//!
//! - [`template`]: Immutable task template and its readers
//! - [`metadata`]: Per-execution metadata
//! - [`context`]: Bundle of capability handles handed to the plugin
//! - [`resource`]: Quota pools for admission control
//! - [`state`]: Round-scoped state persistence
//! - [`cache`]: Result cache client
//! - [`events`]: Phase events and recorders
//! - [`io`]: Input/output locations and secrets
//! - [`error`]: Tagged errors surfaced to the engine

pub mod cache;
pub mod context;
pub mod error;
pub mod events;
pub mod io;
pub mod metadata;
pub mod resource;
pub mod state;
pub mod template;

pub use cache::{CacheClient, CacheEntry, CacheKey, InMemoryCache};
pub use context::TaskExecutionContext;
pub use error::{ErrorCode, PluginError};
pub use events::{EventsRecorder, Phase, PhaseInfo, TimelineRecorder};
pub use io::{EnvSecretManager, InputReader, OutputWriter, PathIo, SecretManager};
pub use metadata::TaskExecutionMetadata;
pub use resource::{
    AllocationStatus, InMemoryResourcePool, ResourceConstraintsSpec, ResourceManager,
    ResourceNamespace,
};
pub use state::{FileStateStore, PluginStateReader, PluginStateWriter, RoundStateStore, Snapshot};
pub use template::{ArrayJob, TaskReader, TaskTemplate};
