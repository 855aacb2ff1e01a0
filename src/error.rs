//! Error Types
//!
//! Errors are split by where they surface:
//!
//! - [`ConfigError`]: raised while loading or registering workflows, before
//!   any run exists. Always fatal, never retried.
//! - [`ActionError`]: returned by a task action. Local to one task instance.
//! - [`StateError`]: an illegal task state transition was requested.
//! - [`OrchestratorError`]: control-loop failures that must reach the operator.

use std::path::PathBuf;

use thiserror::Error;

use crate::schedule::recurrence::RecurrenceError;
use crate::schedule::window::LogicalWindow;
use crate::workflow::template::{ResolveError, TemplateError};

/// Configuration problems detected at load or registration time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workflow '{workflow}': invalid recurrence '{expression}': {source}")]
    InvalidRecurrence {
        workflow: String,
        expression: String,
        #[source]
        source: RecurrenceError,
    },

    #[error("workflow '{workflow}': start boundary {start} is after end boundary {end}")]
    InvalidBoundaries {
        workflow: String,
        start: String,
        end: String,
    },

    #[error("workflow '{0}': max_active_runs must be at least 1")]
    InvalidConcurrency(String),

    #[error("invalid timestamp '{value}': expected YYYY-MM, YYYY-MM-DD or an RFC 3339 datetime")]
    InvalidTimestamp { value: String },

    #[error("workflow has an empty name")]
    EmptyWorkflowName,

    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflow(String),

    #[error("workflow '{0}' has no tasks")]
    EmptyTemplate(String),

    #[error("workflow '{workflow}': a task has an empty id")]
    EmptyTaskId { workflow: String },

    #[error("workflow '{workflow}': duplicate task id '{task}'")]
    DuplicateTask { workflow: String, task: String },

    #[error("workflow '{workflow}': task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        workflow: String,
        task: String,
        dependency: String,
    },

    #[error("workflow '{0}' contains cyclic task dependencies")]
    CyclicDependency(String),

    #[error("workflow '{workflow}': task '{task}' uses unknown action '{action}'")]
    UnknownAction {
        workflow: String,
        task: String,
        action: String,
    },

    #[error("workflow '{workflow}': task '{task}' is missing required parameter '{param}'")]
    MissingParameter {
        workflow: String,
        task: String,
        param: String,
    },

    #[error(
        "workflow '{workflow}': task '{task}' declares unsupported input format '{format}' (accepted: {accepted})"
    )]
    UnsupportedFormat {
        workflow: String,
        task: String,
        format: String,
        accepted: String,
    },

    #[error("workflow '{workflow}': parameter '{param}' of '{scope}': {source}")]
    Template {
        workflow: String,
        scope: String,
        param: String,
        #[source]
        source: TemplateError,
    },

    #[error("workflow '{workflow}': {reason}")]
    InvalidDefinition { workflow: String, reason: String },

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{origin}': {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("environment variable {0} is required")]
    MissingEnv(&'static str),

    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

/// Failure reported by a task action.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    /// Network, storage or process failure that may succeed on a later attempt.
    #[error("{0}")]
    Transient(String),

    /// Input the action cannot handle. Retrying cannot help.
    #[error("unsupported input '{path}': {reason}")]
    UnsupportedInput { path: String, reason: String },

    #[error("missing parameter '{0}'")]
    MissingParameter(String),
}

impl ActionError {
    /// Builds a transient failure from any displayable error.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Returns true if the orchestrator may retry the failed attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for ActionError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// An illegal task instance transition.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("task '{task}' cannot move from {from} to {to}")]
pub struct StateError {
    pub task: String,
    pub from: &'static str,
    pub to: &'static str,
}

/// Control-loop failures. These are fatal for the driver.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("workflow '{workflow}': window {window} already has an active run")]
    WindowAlreadyActive {
        workflow: String,
        window: LogicalWindow,
    },

    #[error("workflow '{workflow}': cannot instantiate run for {window}: {source}")]
    Instantiation {
        workflow: String,
        window: LogicalWindow,
        #[source]
        source: ResolveError,
    },

    #[error("workflow '{workflow}': action '{action}' is not registered")]
    UnknownAction { workflow: String, action: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("worker pool disconnected")]
    DispatcherDisconnected,
}
