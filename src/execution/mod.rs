//! Local Execution
//!
//! Drives an array task to completion on one machine, standing in for the
//! workflow engine that would otherwise call the controller each round.
//!
//! # Structure
//!
//! - [`engine`]: Round loop with pause/abort flags and persisted state
//! - [`pool`]: Bounded worker pool for per-child operations

pub mod engine;
pub mod pool;

pub use engine::{Engine, RunSummary};
