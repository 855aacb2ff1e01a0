//! Task Instance State Machine
//!
//! ```text
//! pending -> ready -> running -> succeeded
//!                       |
//!                       +-> failed-retrying -> ready (once retry_at has passed)
//!                       +-> failed-exhausted
//! ```
//!
//! `succeeded` and `failed-exhausted` are terminal. Every other transition
//! request is rejected with a [`StateError`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error::{ActionError, StateError};
use crate::workflow::RetryPolicy;

/// Runtime state of one task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    FailedRetrying { retry_at: DateTime<Utc> },
    FailedExhausted,
}

impl TaskState {
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::FailedRetrying { .. } => "failed-retrying",
            TaskState::FailedExhausted => "failed-exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::FailedExhausted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::FailedRetrying { retry_at } => {
                write!(f, "{} (retry at {})", self.label(), retry_at.format("%H:%M:%S"))
            }
            other => f.write_str(other.label()),
        }
    }
}

/// One template entry bound to a run, with its resolved parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInstance {
    /// Index of the template entry this instance was created from
    pub index: usize,
    pub task_id: String,
    pub action: String,
    pub params: BTreeMap<String, String>,
    pub retry: RetryPolicy,
    state: TaskState,
    attempts: u32,
    last_error: Option<ActionError>,
}

impl TaskInstance {
    pub fn new(
        index: usize,
        task_id: impl Into<String>,
        action: impl Into<String>,
        params: BTreeMap<String, String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            task_id: task_id.into(),
            action: action.into(),
            params,
            retry,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Number of attempts dispatched so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&ActionError> {
        self.last_error.as_ref()
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            TaskState::FailedRetrying { retry_at } => Some(retry_at),
            _ => None,
        }
    }

    fn reject(&self, to: &'static str) -> StateError {
        StateError {
            task: self.task_id.clone(),
            from: self.state.label(),
            to,
        }
    }

    /// `pending -> ready`, once every upstream instance has succeeded.
    pub fn mark_ready(&mut self) -> Result<(), StateError> {
        match self.state {
            TaskState::Pending => {
                self.state = TaskState::Ready;
                Ok(())
            }
            _ => Err(self.reject("ready")),
        }
    }

    /// `failed-retrying -> ready` when the backoff has elapsed. Returns
    /// whether the instance was released.
    pub fn release_if_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::FailedRetrying { retry_at } if now >= retry_at => {
                debug!("Task '{}' released for attempt {}", self.task_id, self.attempts + 1);
                self.state = TaskState::Ready;
                true
            }
            _ => false,
        }
    }

    /// `ready -> running`. Returns the 1-based attempt number.
    pub fn mark_running(&mut self) -> Result<u32, StateError> {
        match self.state {
            TaskState::Ready => {
                self.attempts += 1;
                self.state = TaskState::Running;
                Ok(self.attempts)
            }
            _ => Err(self.reject("running")),
        }
    }

    pub fn mark_succeeded(&mut self) -> Result<(), StateError> {
        match self.state {
            TaskState::Running => {
                self.state = TaskState::Succeeded;
                self.last_error = None;
                Ok(())
            }
            _ => Err(self.reject("succeeded")),
        }
    }

    /// Records a failed attempt and decides between retry and exhaustion.
    ///
    /// A retryable failure is retried while `attempts <= max_retries`, so an
    /// instance runs at most `max_retries + 1` times. Non-retryable failures
    /// exhaust immediately.
    pub fn mark_failed(
        &mut self,
        error: &ActionError,
        now: DateTime<Utc>,
    ) -> Result<TaskState, StateError> {
        if self.state != TaskState::Running {
            return Err(self.reject("failed"));
        }

        self.last_error = Some(error.clone());
        self.state = if error.is_retryable() && self.attempts <= self.retry.max_retries {
            TaskState::FailedRetrying {
                retry_at: now + self.retry.backoff(self.attempts),
            }
        } else {
            warn!(
                "Task '{}' exhausted after {} attempt(s): {}",
                self.task_id, self.attempts, error
            );
            TaskState::FailedExhausted
        };
        Ok(self.state)
    }
}
