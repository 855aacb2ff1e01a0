//! Runs
//!
//! A [`Run`] is one instantiation of a workflow's task template bound to a
//! logical window. It owns one [`TaskInstance`] per template entry and
//! derives its own state from theirs:
//!
//! - `succeeded` iff every instance succeeded
//! - `failed` iff any instance is `failed-exhausted`
//! - `running` otherwise
//!
//! A failed run dispatches nothing further. Instances that never got to run
//! are reported as abandoned.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::debug;

use super::instance::{TaskInstance, TaskState};
use crate::error::{ActionError, StateError};
use crate::monitoring::{EventType, RunTimeline};
use crate::schedule::LogicalWindow;
use crate::workflow::template::ResolveError;
use crate::workflow::{RegisteredWorkflow, TaskGraph, TemplateContext};

/// Derived state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        })
    }
}

/// Why a run exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        })
    }
}

/// What a completed attempt led to.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded,
    RetryScheduled { retry_at: DateTime<Utc>, attempt: u32 },
    Exhausted { error: ActionError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    workflow: String,
    window: LogicalWindow,
    trigger: Trigger,
    graph: TaskGraph,
    instances: Vec<TaskInstance>,
    timeline: RunTimeline,
}

impl Run {
    /// Binds the template of `registered` to `window`, resolving every
    /// parameter. Resolution is pure: the same inputs give the same run.
    pub fn instantiate(
        registered: &RegisteredWorkflow,
        window: LogicalWindow,
        trigger: Trigger,
        variables: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ResolveError> {
        let definition = &registered.definition;
        let context = TemplateContext::for_window(&window, &definition.params, variables)?;

        let instances = definition
            .template
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                context.resolve(&entry.params).map(|params| {
                    TaskInstance::new(
                        index,
                        entry.id.clone(),
                        entry.action.clone(),
                        params,
                        definition.retry_policy_for(index),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Instantiated {} run of '{}' for {} ({} tasks)",
            trigger,
            definition.name,
            window,
            instances.len()
        );

        Ok(Self {
            workflow: definition.name.clone(),
            window,
            trigger,
            graph: registered.graph.clone(),
            instances,
            timeline: RunTimeline::new(now),
        })
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn window(&self) -> LogicalWindow {
        self.window
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn instances(&self) -> &[TaskInstance] {
        &self.instances
    }

    pub fn instance(&self, index: usize) -> Option<&TaskInstance> {
        self.instances.get(index)
    }

    /// Looks an instance up by task id.
    pub fn task(&self, task_id: &str) -> Option<&TaskInstance> {
        self.instances.iter().find(|t| t.task_id == task_id)
    }

    pub fn timeline(&self) -> &RunTimeline {
        &self.timeline
    }

    pub fn state(&self) -> RunState {
        if self
            .instances
            .iter()
            .any(|t| t.state() == TaskState::FailedExhausted)
        {
            RunState::Failed
        } else if self
            .instances
            .iter()
            .all(|t| t.state() == TaskState::Succeeded)
        {
            RunState::Succeeded
        } else {
            RunState::Running
        }
    }

    /// Number of instances currently handed to a worker.
    pub fn running(&self) -> usize {
        self.instances
            .iter()
            .filter(|t| t.state() == TaskState::Running)
            .count()
    }

    /// A run is finished once its state is terminal and no attempt is still
    /// in flight.
    pub fn is_finished(&self) -> bool {
        self.state() != RunState::Running && self.running() == 0
    }

    /// Moves instances whose upstream tasks all succeeded to `ready`, and
    /// releases retries whose backoff has elapsed. Returns the indices that
    /// became ready, in dependency order.
    pub fn promote_ready(&mut self, now: DateTime<Utc>) -> Vec<usize> {
        if self.state() == RunState::Failed {
            return Vec::new();
        }

        let mut promoted = Vec::new();
        for &index in self.graph.order() {
            let upstream_done = self
                .graph
                .upstream(index)
                .iter()
                .all(|&up| self.instances[up].state() == TaskState::Succeeded);

            let task = &mut self.instances[index];
            let became_ready = match task.state() {
                TaskState::Pending if upstream_done => task.mark_ready().is_ok(),
                TaskState::FailedRetrying { .. } => task.release_if_due(now),
                _ => false,
            };
            if became_ready {
                promoted.push(index);
            }
        }
        promoted
    }

    /// Ready instances in dependency order. Empty once the run has failed.
    pub fn ready_tasks(&self) -> Vec<usize> {
        if self.state() == RunState::Failed {
            return Vec::new();
        }
        self.graph
            .order()
            .iter()
            .copied()
            .filter(|&i| self.instances[i].state() == TaskState::Ready)
            .collect()
    }

    fn instance_mut(&mut self, index: usize) -> Result<&mut TaskInstance, StateError> {
        self.instances.get_mut(index).ok_or_else(|| StateError {
            task: format!("#{}", index),
            from: "missing",
            to: "running",
        })
    }

    /// Marks an instance as dispatched. Returns its attempt number.
    pub fn start_task(&mut self, index: usize, now: DateTime<Utc>) -> Result<u32, StateError> {
        let task = self.instance_mut(index)?;
        let attempt = task.mark_running()?;
        let task_id = task.task_id.clone();
        self.timeline
            .add_event(task_id, EventType::Dispatched, attempt, now);
        Ok(attempt)
    }

    /// Applies the result of an attempt.
    pub fn complete_task(
        &mut self,
        index: usize,
        result: Result<(), ActionError>,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome, StateError> {
        let task = self.instance_mut(index)?;
        let attempt = task.attempts();
        let task_id = task.task_id.clone();

        let (outcome, event) = match result {
            Ok(()) => {
                task.mark_succeeded()?;
                (TaskOutcome::Succeeded, EventType::Succeeded)
            }
            Err(error) => match task.mark_failed(&error, now)? {
                TaskState::FailedRetrying { retry_at } => (
                    TaskOutcome::RetryScheduled { retry_at, attempt },
                    EventType::RetryScheduled,
                ),
                _ => (TaskOutcome::Exhausted { error }, EventType::Exhausted),
            },
        };

        self.timeline.add_event(task_id, event, attempt, now);
        Ok(outcome)
    }

    /// Instances that will never run because the run failed.
    pub fn abandoned(&self) -> Vec<&TaskInstance> {
        if self.state() != RunState::Failed {
            return Vec::new();
        }
        self.instances
            .iter()
            .filter(|t| !t.state().is_terminal() && t.state() != TaskState::Running)
            .collect()
    }

    /// Instances that exhausted their attempts.
    pub fn failures(&self) -> Vec<&TaskInstance> {
        self.instances
            .iter()
            .filter(|t| t.state() == TaskState::FailedExhausted)
            .collect()
    }

    /// Earliest pending retry, if any.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.instances.iter().filter_map(TaskInstance::retry_at).min()
    }

    /// `(succeeded, total)`
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .instances
            .iter()
            .filter(|t| t.state() == TaskState::Succeeded)
            .count();
        (done, self.instances.len())
    }

    /// One-line description of the run and, on failure, what went wrong.
    pub fn summary(&self) -> String {
        let (done, total) = self.progress();
        let mut line = format!(
            "{} {} [{}] {}: {}/{} tasks succeeded",
            self.workflow,
            self.window,
            self.trigger,
            self.state(),
            done,
            total
        );
        for task in self.failures() {
            if let Some(error) = task.last_error() {
                line.push_str(&format!("; '{}' failed: {}", task.task_id, error));
            }
        }
        let abandoned: Vec<&str> = self
            .abandoned()
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        if !abandoned.is_empty() {
            line.push_str(&format!("; abandoned: {}", abandoned.join(", ")));
        }
        line
    }
}
