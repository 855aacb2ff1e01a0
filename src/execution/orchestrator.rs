//! Orchestrator
//!
//! The control loop. Each call to [`Orchestrator::tick`] performs, in order:
//!
//! 1. Collect completions from the dispatcher and apply them to their runs
//! 2. Archive runs that have finished
//! 3. Create runs for queued manual triggers, then for due windows, oldest
//!    first, up to each workflow's `max_active_runs`
//! 4. Promote pending instances whose upstream tasks succeeded, and retries
//!    whose backoff has elapsed
//! 5. Dispatch ready instances round-robin across workflows while the
//!    dispatcher has capacity
//!
//! All task state changes happen inside `tick`, so the loop can be driven
//! with any clock. The binary ticks on a fixed interval; tests tick with
//! synthetic timestamps.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use super::dispatch::{Completion, DispatchRequest, Dispatcher, TaskKey};
use super::run::{Run, RunState, TaskOutcome, Trigger};
use crate::error::{ActionError, OrchestratorError};
use crate::schedule::{LogicalWindow, Schedule};
use crate::workflow::WorkflowRegistry;

/// Finished runs kept per workflow unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 64;

/// Something the orchestrator did during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    RunCreated {
        workflow: String,
        window: LogicalWindow,
        trigger: Trigger,
    },
    TaskDispatched {
        workflow: String,
        window: LogicalWindow,
        task: String,
        attempt: u32,
    },
    TaskSucceeded {
        workflow: String,
        window: LogicalWindow,
        task: String,
        attempt: u32,
    },
    RetryScheduled {
        workflow: String,
        window: LogicalWindow,
        task: String,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    TaskExhausted {
        workflow: String,
        window: LogicalWindow,
        task: String,
        attempts: u32,
        error: ActionError,
    },
    RunFinished {
        workflow: String,
        window: LogicalWindow,
        state: RunState,
        abandoned: Vec<String>,
    },
}

impl fmt::Display for TickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickAction::RunCreated {
                workflow,
                window,
                trigger,
            } => write!(f, "created {} run {} {}", trigger, workflow, window),
            TickAction::TaskDispatched {
                workflow,
                window,
                task,
                attempt,
            } => write!(f, "dispatched {}/{} {} (attempt {})", workflow, task, window, attempt),
            TickAction::TaskSucceeded {
                workflow,
                window,
                task,
                attempt,
            } => write!(f, "succeeded {}/{} {} (attempt {})", workflow, task, window, attempt),
            TickAction::RetryScheduled {
                workflow,
                window,
                task,
                attempt,
                retry_at,
            } => write!(
                f,
                "retry {}/{} {} after attempt {} at {}",
                workflow, task, window, attempt, retry_at
            ),
            TickAction::TaskExhausted {
                workflow,
                window,
                task,
                attempts,
                error,
            } => write!(
                f,
                "exhausted {}/{} {} after {} attempt(s): {}",
                workflow, task, window, attempts, error
            ),
            TickAction::RunFinished {
                workflow,
                window,
                state,
                abandoned,
            } => {
                write!(f, "finished {} {}: {}", workflow, window, state)?;
                if !abandoned.is_empty() {
                    write!(f, " (abandoned: {})", abandoned.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

/// Everything one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub now: DateTime<Utc>,
    pub actions: Vec<TickAction>,
}

impl TickReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            actions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Windows of the runs created this tick, per workflow.
    pub fn runs_created(&self) -> Vec<(&str, LogicalWindow)> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                TickAction::RunCreated {
                    workflow, window, ..
                } => Some((workflow.as_str(), *window)),
                _ => None,
            })
            .collect()
    }

    pub fn runs_finished(&self) -> Vec<(&str, LogicalWindow, RunState)> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                TickAction::RunFinished {
                    workflow,
                    window,
                    state,
                    ..
                } => Some((workflow.as_str(), *window, *state)),
                _ => None,
            })
            .collect()
    }

    pub fn dispatched(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, TickAction::TaskDispatched { .. }))
            .count()
    }
}

/// Runtime bookkeeping of one workflow.
#[derive(Debug, Default)]
struct WorkflowRuns {
    active: BTreeMap<LogicalWindow, Run>,
    /// Last window handed out by schedule enumeration
    cursor: Option<LogicalWindow>,
    finished: BTreeSet<LogicalWindow>,
    history: VecDeque<Run>,
    manual: VecDeque<LogicalWindow>,
}

impl WorkflowRuns {
    fn is_known(&self, window: &LogicalWindow) -> bool {
        self.active.contains_key(window) || self.finished.contains(window)
    }

    /// Next window enumeration would start a run for, advancing the cursor.
    fn next_scheduled(&mut self, schedule: &Schedule, now: DateTime<Utc>) -> Option<LogicalWindow> {
        if schedule.catchup {
            loop {
                let window = schedule.next_due(self.cursor.as_ref(), now)?;
                self.cursor = Some(window);
                if !self.is_known(&window) {
                    return Some(window);
                }
                debug!("Window {} already has a run, skipping", window);
            }
        }

        let latest = schedule.latest_due(now)?;
        if self.cursor.map_or(false, |cursor| latest <= cursor) {
            return None;
        }
        self.cursor = Some(latest);
        (!self.is_known(&latest)).then_some(latest)
    }
}

/// Drives every registered workflow.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use chrono::Utc;
/// use ingestrunner::actions::ActionRegistry;
/// use ingestrunner::config::{ConfigOverrides, ProcessConfig};
/// use ingestrunner::execution::{Orchestrator, ThreadDispatcher};
/// use ingestrunner::workflow::{load_workflows, WorkflowRegistry};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ProcessConfig::from_env(&ConfigOverrides::default())?;
///     let actions = ActionRegistry::with_defaults(&config);
///     let mut registry = WorkflowRegistry::new(Arc::new(actions), config.variables());
///     registry.register_all(load_workflows("demos/taxi.yaml")?)?;
///
///     let dispatcher = ThreadDispatcher::new(config.workers);
///     let mut orchestrator = Orchestrator::new(Arc::new(registry), Box::new(dispatcher));
///     let report = orchestrator.tick(Utc::now())?;
///     println!("{} actions", report.actions.len());
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    registry: Arc<WorkflowRegistry>,
    dispatcher: Box<dyn Dispatcher>,
    runs: BTreeMap<String, WorkflowRuns>,
    buffered: Vec<Completion>,
    history_limit: usize,
    /// Workflow position the next dispatch pass starts from.
    dispatch_cursor: usize,
}

impl Orchestrator {
    pub fn new(registry: Arc<WorkflowRegistry>, dispatcher: Box<dyn Dispatcher>) -> Self {
        let runs = registry
            .names()
            .into_iter()
            .map(|name| (name.to_string(), WorkflowRuns::default()))
            .collect();
        info!(
            "Orchestrator ready: {} workflows, {} workers",
            registry.len(),
            dispatcher.capacity()
        );
        Self {
            registry,
            dispatcher,
            runs,
            buffered: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            dispatch_cursor: 0,
        }
    }

    /// Number of finished runs kept per workflow. Finished windows are
    /// remembered regardless.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Queues a run for `window`, independent of schedule enumeration.
    ///
    /// A window that already has an active or queued run is rejected. A
    /// window that finished earlier is run again.
    pub fn trigger(&mut self, workflow: &str, window: LogicalWindow) -> Result<(), OrchestratorError> {
        let runs = self
            .runs
            .get_mut(workflow)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow.to_string()))?;

        if runs.active.contains_key(&window) || runs.manual.contains(&window) {
            return Err(OrchestratorError::WindowAlreadyActive {
                workflow: workflow.to_string(),
                window,
            });
        }
        if runs.finished.contains(&window) {
            info!("Re-running finished window {} of '{}'", window, workflow);
        }

        runs.manual.push_back(window);
        info!("Queued manual run of '{}' for {}", workflow, window);
        Ok(())
    }

    /// Advances every workflow to `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, OrchestratorError> {
        let mut report = TickReport::new(now);

        let mut completions = std::mem::take(&mut self.buffered);
        completions.extend(self.dispatcher.poll()?);
        for completion in completions {
            self.apply_completion(completion, now, &mut report)?;
        }

        self.finalize_runs(&mut report);
        self.create_runs(now, &mut report)?;
        for runs in self.runs.values_mut() {
            for run in runs.active.values_mut() {
                run.promote_ready(now);
            }
        }
        self.dispatch(now, &mut report)?;

        for action in &report.actions {
            debug!("tick {}: {}", now.format("%Y-%m-%dT%H:%M:%S"), action);
        }
        Ok(report)
    }

    fn apply_completion(
        &mut self,
        completion: Completion,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let Completion { key, result } = completion;
        let Some(run) = self
            .runs
            .get_mut(&key.workflow)
            .and_then(|runs| runs.active.get_mut(&key.window))
        else {
            warn!("Dropping completion for unknown run {}", key);
            return Ok(());
        };

        let task = run
            .instance(key.index)
            .map(|t| t.task_id.clone())
            .unwrap_or_default();
        let workflow = key.workflow;
        let window = key.window;

        let action = match run.complete_task(key.index, result, now)? {
            TaskOutcome::Succeeded => {
                info!("Task '{}' of {} {} succeeded", task, workflow, window);
                TickAction::TaskSucceeded {
                    workflow,
                    window,
                    task,
                    attempt: key.attempt,
                }
            }
            TaskOutcome::RetryScheduled { retry_at, attempt } => {
                warn!(
                    "Task '{}' of {} {} failed (attempt {}), retrying at {}",
                    task, workflow, window, attempt, retry_at
                );
                TickAction::RetryScheduled {
                    workflow,
                    window,
                    task,
                    attempt,
                    retry_at,
                }
            }
            TaskOutcome::Exhausted { error } => {
                error!("Task '{}' of {} {} failed: {}", task, workflow, window, error);
                TickAction::TaskExhausted {
                    workflow,
                    window,
                    task,
                    attempts: key.attempt,
                    error,
                }
            }
        };
        report.actions.push(action);
        Ok(())
    }

    fn finalize_runs(&mut self, report: &mut TickReport) {
        let history_limit = self.history_limit;
        for (name, runs) in self.runs.iter_mut() {
            let done: Vec<LogicalWindow> = runs
                .active
                .iter()
                .filter(|(_, run)| run.is_finished())
                .map(|(window, _)| *window)
                .collect();

            for window in done {
                let Some(run) = runs.active.remove(&window) else {
                    continue;
                };
                let state = run.state();
                let abandoned = run
                    .abandoned()
                    .iter()
                    .map(|t| t.task_id.clone())
                    .collect();

                if state == RunState::Succeeded {
                    info!("Run finished: {}", run.summary());
                } else {
                    error!("Run finished: {}", run.summary());
                }
                debug!("{}", run.timeline().gantt_chart());

                runs.finished.insert(window);
                runs.history.push_back(run);
                while runs.history.len() > history_limit {
                    runs.history.pop_front();
                }

                report.actions.push(TickAction::RunFinished {
                    workflow: name.clone(),
                    window,
                    state,
                    abandoned,
                });
            }
        }
    }

    fn create_runs(&mut self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), OrchestratorError> {
        let registry = Arc::clone(&self.registry);

        for registered in registry.iter() {
            let name = registered.name();
            let Some(runs) = self.runs.get_mut(name) else {
                continue;
            };
            let schedule = &registered.definition.schedule;

            while runs.active.len() < schedule.max_active_runs {
                let (window, trigger) = if let Some(window) = runs.manual.pop_front() {
                    (window, Trigger::Manual)
                } else if let Some(window) = runs.next_scheduled(schedule, now) {
                    (window, Trigger::Scheduled)
                } else {
                    break;
                };

                let run = Run::instantiate(registered, window, trigger, registry.variables(), now)
                    .map_err(|source| OrchestratorError::Instantiation {
                        workflow: name.to_string(),
                        window,
                        source,
                    })?;

                info!("Created {} run of '{}' for {}", trigger, name, window);
                runs.active.insert(window, run);
                report.actions.push(TickAction::RunCreated {
                    workflow: name.to_string(),
                    window,
                    trigger,
                });
            }
        }
        Ok(())
    }

    /// Hands out free workers one ready task per workflow per pass. The
    /// first workflow considered rotates so a long backfill cannot hold
    /// every worker while other workflows wait.
    fn dispatch(&mut self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), OrchestratorError> {
        let names: Vec<String> = self.runs.keys().cloned().collect();
        if names.is_empty() {
            return Ok(());
        }

        let first = self.dispatch_cursor % names.len();
        let mut progressed = true;
        while progressed {
            progressed = false;
            for offset in 0..names.len() {
                let position = (first + offset) % names.len();
                if self.dispatcher.available() == 0 {
                    debug!("All {} workers busy", self.dispatcher.capacity());
                    self.dispatch_cursor = position;
                    return Ok(());
                }
                if self.dispatch_next(&names[position], now, report)? {
                    progressed = true;
                }
            }
        }
        self.dispatch_cursor = first + 1;
        Ok(())
    }

    /// Starts the first ready task of `name`, oldest window first.
    fn dispatch_next(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<bool, OrchestratorError> {
        let Some(runs) = self.runs.get_mut(name) else {
            return Ok(false);
        };
        let Some((run, index)) = runs.active.values_mut().find_map(|run| {
            let index = run.ready_tasks().into_iter().next()?;
            Some((run, index))
        }) else {
            return Ok(false);
        };
        let Some(instance) = run.instance(index) else {
            return Ok(false);
        };

        let action = self.registry.actions().get(&instance.action).ok_or_else(|| {
            OrchestratorError::UnknownAction {
                workflow: name.to_string(),
                action: instance.action.clone(),
            }
        })?;
        let task_id = instance.task_id.clone();
        let params = instance.params.clone();

        let attempt = run.start_task(index, now)?;
        let window = run.window();
        info!("Dispatching '{}' of {} {} (attempt {})", task_id, name, window, attempt);

        self.dispatcher.submit(DispatchRequest {
            key: TaskKey {
                workflow: name.to_string(),
                window,
                index,
                attempt,
            },
            task_id: task_id.clone(),
            action,
            params,
        })?;

        report.actions.push(TickAction::TaskDispatched {
            workflow: name.to_string(),
            window,
            task: task_id,
            attempt,
        });
        Ok(true)
    }

    /// Blocks until a dispatched attempt finishes or `timeout` elapses.
    /// Completions are applied by the next `tick`. Returns how many arrived.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> Result<usize, OrchestratorError> {
        let completions = self.dispatcher.wait(timeout)?;
        let count = completions.len();
        self.buffered.extend(completions);
        Ok(count)
    }

    /// Attempts handed to workers whose completion has not been collected.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight() + self.buffered.len()
    }

    /// True when no run is active, no manual trigger is queued and nothing
    /// is in flight.
    pub fn is_idle(&self) -> bool {
        self.dispatcher.in_flight() == 0
            && self.buffered.is_empty()
            && self
                .runs
                .values()
                .all(|runs| runs.active.is_empty() && runs.manual.is_empty())
    }

    /// Earliest scheduled retry across all active runs.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.runs
            .values()
            .flat_map(|runs| runs.active.values())
            .filter_map(Run::next_retry_at)
            .min()
    }

    pub fn active_runs(&self, workflow: &str) -> Vec<&Run> {
        self.runs
            .get(workflow)
            .map(|runs| runs.active.values().collect())
            .unwrap_or_default()
    }

    /// Every window of `workflow` that has had a run finish.
    pub fn finished_windows(&self, workflow: &str) -> Option<&BTreeSet<LogicalWindow>> {
        self.runs.get(workflow).map(|runs| &runs.finished)
    }

    /// Most recent finished runs of `workflow`, oldest first.
    pub fn history(&self, workflow: &str) -> Vec<&Run> {
        self.runs
            .get(workflow)
            .map(|runs| runs.history.iter().collect())
            .unwrap_or_default()
    }
}
