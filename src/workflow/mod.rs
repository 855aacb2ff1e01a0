//! Workflow Definition Module
//!
//! Data structures and utilities for defining, parsing and validating
//! scheduled ingestion workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (TaskEntry, TaskTemplate, WorkflowDefinition)
//! - [`parser`]: YAML parsing and loading
//! - [`pipelines`]: Fixed ingestion shapes usable as shorthands
//! - [`template`]: `{field}` placeholder rendering
//! - [`validator`]: Registration-time checks and dependency ordering
//! - [`registry`]: The set of validated workflows shared with the orchestrator

pub mod model;
pub mod parser;
pub mod pipelines;
pub mod registry;
pub mod template;
pub mod validator;

pub use model::{RetryPolicy, TaskEntry, TaskGraph, TaskTemplate, WorkflowDefinition};
pub use parser::{load_workflows, parse_workflows, parse_workflows_at};
pub use pipelines::Pipeline;
pub use registry::{RegisteredWorkflow, WorkflowRegistry};
pub use template::TemplateContext;
pub use validator::validate_definition;
