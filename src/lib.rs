//! IngestRunner - Scheduled Dataset Ingestion Engine
//!
//! Materializes time-partitioned datasets on a recurring schedule. Each
//! workflow pairs a recurrence rule with a small task graph (download,
//! convert, upload, clean up) that is instantiated once per logical window
//! and retried per task with backoff.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`schedule`]: Recurrence rules and logical window enumeration
//! - [`workflow`]: Definitions, YAML loading, validation and the registry
//! - [`execution`]: Runs, task state machine, dispatchers and the orchestrator
//! - [`actions`]: The fetch, transform, publish and cleanup task actions
//! - [`monitoring`]: Per-run execution timeline
//! - [`config`]: Process configuration from the environment
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use ingestrunner::{
//!     load_workflows, ActionRegistry, ConfigOverrides, Orchestrator, ProcessConfig,
//!     ThreadDispatcher, WorkflowRegistry,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessConfig::from_env(&ConfigOverrides::default())?;
//!
//!     // Validate every workflow up front
//!     let actions = Arc::new(ActionRegistry::with_defaults(&config));
//!     let mut registry = WorkflowRegistry::new(actions, config.variables());
//!     registry.register_all(load_workflows("demos/taxi.yaml")?)?;
//!
//!     // Tick until the backfill is done
//!     let dispatcher = Box::new(ThreadDispatcher::new(config.workers));
//!     let mut orchestrator = Orchestrator::new(Arc::new(registry), dispatcher);
//!     loop {
//!         orchestrator.tick(Utc::now())?;
//!         if orchestrator.is_idle() {
//!             break;
//!         }
//!         orchestrator.wait_for_completion(config.tick)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod schedule;
pub mod workflow;

// Re-export commonly used types
pub use actions::{ActionRegistry, TaskAction};
pub use config::{ConfigOverrides, ProcessConfig};
pub use error::{ActionError, ConfigError, OrchestratorError};
pub use execution::{Orchestrator, Run, RunState, ThreadDispatcher, TickReport};
pub use schedule::{LogicalWindow, Schedule};
pub use workflow::{load_workflows, WorkflowDefinition, WorkflowRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "IngestRunner";
