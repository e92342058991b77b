//! ArrayRunner - Array Task Execution Core
//!
//! Fans one logical task out into many identical children, each running as
//! its own cluster work unit, and drives them to a single aggregate outcome.
//! The controller is invoked in rounds by a workflow engine; between rounds
//! it keeps everything it needs in a small persisted state.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`core`]: Capabilities the engine hands to the plugin (template,
//!   state store, admission control, cache, events)
//! - [`cluster`]: Work-unit model and the cluster the units run on
//! - [`array`]: The array task controller and its template builder
//! - [`execution`]: Local round driver and worker pool
//!
//! # Example
//!
//! ```rust,no_run
//! use arrayrunner::array::Config;
//! use arrayrunner::execution::Engine;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new("map_square.yaml");
//!     engine.set_config(Config::load_default()?);
//!     engine.set_io("/data/in", "/data/out");
//!
//!     let summary = engine.run()?;
//!     println!("{:?}: {}", summary.phase, summary.counts);
//!     Ok(())
//! }
//! ```

pub mod array;
pub mod cluster;
pub mod core;
pub mod execution;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use array::{ArrayJobController, ArrayPhase, Config};
pub use crate::core::{PluginError, TaskExecutionContext};
pub use execution::engine::Engine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ArrayRunner";
