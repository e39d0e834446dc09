//! flowplane - Flow scheduling and execution engine
//!
//! Flows are ordered stages of tasks. The engine admits them through a
//! dependency graph, a pluggable scheduling policy and a resource ledger, runs
//! them against a [`backends::TaskBackend`], and recovers failed tasks with
//! classified retries.

pub mod backends;
pub mod cli;
pub mod config;
pub mod control;
pub mod dag;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod policy;
pub mod recovery;
pub mod scheduler;
pub mod state;

pub use error::{EngineError, Result};
pub use orchestrator::Orchestrator;
