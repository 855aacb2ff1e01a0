//! Task Dispatch
//!
//! The orchestrator hands ready task instances to a [`Dispatcher`] and
//! collects their completions on later ticks. Two implementations:
//!
//! - [`ThreadDispatcher`]: one worker thread per in-flight attempt, bounded
//!   by a capacity, reporting back over an `mpsc` channel
//! - [`InlineDispatcher`]: runs the action during `submit` and queues the
//!   result, for deterministic tests

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error};

use crate::actions::TaskAction;
use crate::error::{ActionError, OrchestratorError};
use crate::schedule::LogicalWindow;

/// Identifies one attempt of one task instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub workflow: String,
    pub window: LogicalWindow,
    /// Template index of the instance
    pub index: usize,
    pub attempt: u32,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{} (attempt {})",
            self.workflow, self.window, self.index, self.attempt
        )
    }
}

/// Everything a worker needs to run one attempt.
pub struct DispatchRequest {
    pub key: TaskKey,
    pub task_id: String,
    pub action: Arc<dyn TaskAction>,
    pub params: BTreeMap<String, String>,
}

impl DispatchRequest {
    /// Runs the action, turning a panic into a transient failure.
    fn execute(self) -> Completion {
        let DispatchRequest {
            key,
            task_id,
            action,
            params,
        } = self;

        debug!("Executing '{}' ({}) for {}", task_id, action.name(), key);
        let result = match catch_unwind(AssertUnwindSafe(|| action.execute(&params))) {
            Ok(result) => result,
            Err(_) => Err(ActionError::Transient(format!(
                "action '{}' panicked",
                action.name()
            ))),
        };
        Completion { key, result }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub key: TaskKey,
    pub result: Result<(), ActionError>,
}

/// Worker pool seen by the orchestrator.
pub trait Dispatcher: Send {
    /// Maximum number of attempts in flight at once.
    fn capacity(&self) -> usize;

    /// Attempts submitted whose completion has not been collected yet.
    fn in_flight(&self) -> usize;

    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_flight())
    }

    fn submit(&mut self, request: DispatchRequest) -> Result<(), OrchestratorError>;

    /// Collects finished attempts without blocking.
    fn poll(&mut self) -> Result<Vec<Completion>, OrchestratorError>;

    /// Blocks until at least one attempt finishes or `timeout` elapses.
    fn wait(&mut self, timeout: Duration) -> Result<Vec<Completion>, OrchestratorError>;
}

/// Runs each attempt on its own std thread.
pub struct ThreadDispatcher {
    capacity: usize,
    in_flight: usize,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl ThreadDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel();
        Self {
            capacity: capacity.max(1),
            in_flight: 0,
            tx,
            rx,
        }
    }

    fn received(&mut self, completion: Completion, out: &mut Vec<Completion>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        out.push(completion);
    }

    fn drain(&mut self, out: &mut Vec<Completion>) -> Result<(), OrchestratorError> {
        loop {
            match self.rx.try_recv() {
                Ok(completion) => self.received(completion, out),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(OrchestratorError::DispatcherDisconnected)
                }
            }
        }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn submit(&mut self, request: DispatchRequest) -> Result<(), OrchestratorError> {
        let tx = self.tx.clone();
        let name = format!("{}-{}", request.key.workflow, request.task_id);

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let completion = request.execute();
                if let Err(e) = tx.send(completion) {
                    error!("Failed to send completion signal: {}", e);
                }
            })
            .map_err(|e| {
                error!("Failed to spawn worker: {}", e);
                OrchestratorError::DispatcherDisconnected
            })?;

        self.in_flight += 1;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Completion>, OrchestratorError> {
        let mut completions = Vec::new();
        self.drain(&mut completions)?;
        Ok(completions)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<Completion>, OrchestratorError> {
        let mut completions = Vec::new();
        if self.in_flight == 0 {
            return Ok(completions);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(completion) => self.received(completion, &mut completions),
            Err(RecvTimeoutError::Timeout) => return Ok(completions),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(OrchestratorError::DispatcherDisconnected)
            }
        }
        self.drain(&mut completions)?;
        Ok(completions)
    }
}

/// Executes attempts synchronously on `submit`. Results are held back until
/// the next `poll`, so the orchestrator observes them one tick later, as it
/// would with real workers.
#[derive(Debug)]
pub struct InlineDispatcher {
    capacity: usize,
    completed: VecDeque<Completion>,
}

impl InlineDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            completed: VecDeque::new(),
        }
    }
}

impl Dispatcher for InlineDispatcher {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.completed.len()
    }

    fn submit(&mut self, request: DispatchRequest) -> Result<(), OrchestratorError> {
        let completion = request.execute();
        self.completed.push_back(completion);
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Completion>, OrchestratorError> {
        Ok(self.completed.drain(..).collect())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Vec<Completion>, OrchestratorError> {
        self.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Sleepy;

    impl TaskAction for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn execute(&self, params: &BTreeMap<String, String>) -> Result<(), ActionError> {
            let ms: u64 = params.get("ms").and_then(|v| v.parse().ok()).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            if params.contains_key("fail") {
                return Err(ActionError::transient("asked to fail"));
            }
            Ok(())
        }
    }

    struct Panicky;

    impl TaskAction for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn execute(&self, _params: &BTreeMap<String, String>) -> Result<(), ActionError> {
            panic!("boom");
        }
    }

    fn request(index: usize, action: Arc<dyn TaskAction>, params: &[(&str, &str)]) -> DispatchRequest {
        DispatchRequest {
            key: TaskKey {
                workflow: "zones".to_string(),
                window: LogicalWindow::parse("2021-05-01").unwrap(),
                index,
                attempt: 1,
            },
            task_id: format!("task{}", index),
            action,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn collect_all(dispatcher: &mut dyn Dispatcher) -> Vec<Completion> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut all = Vec::new();
        while dispatcher.in_flight() > 0 && Instant::now() < deadline {
            all.extend(dispatcher.wait(Duration::from_millis(100)).unwrap());
        }
        all
    }

    #[test]
    fn test_thread_dispatcher_runs_in_parallel() {
        let mut dispatcher = ThreadDispatcher::new(3);
        let action: Arc<dyn TaskAction> = Arc::new(Sleepy);
        for i in 0..3 {
            dispatcher
                .submit(request(i, Arc::clone(&action), &[("ms", "50")]))
                .unwrap();
        }
        assert_eq!(dispatcher.in_flight(), 3);
        assert_eq!(dispatcher.available(), 0);

        let mut completions = collect_all(&mut dispatcher);
        completions.sort_by_key(|c| c.key.index);
        assert_eq!(completions.len(), 3);
        assert!(completions.iter().all(|c| c.result.is_ok()));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn test_thread_dispatcher_reports_failures() {
        let mut dispatcher = ThreadDispatcher::new(2);
        dispatcher
            .submit(request(0, Arc::new(Sleepy), &[("fail", "yes")]))
            .unwrap();
        dispatcher.submit(request(1, Arc::new(Panicky), &[])).unwrap();

        let completions = collect_all(&mut dispatcher);
        assert_eq!(completions.len(), 2);
        for completion in completions {
            let err = completion.result.unwrap_err();
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_wait_without_work_returns_immediately() {
        let mut dispatcher = ThreadDispatcher::new(1);
        let start = Instant::now();
        assert!(dispatcher.wait(Duration::from_secs(5)).unwrap().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_inline_dispatcher_defers_results_to_poll() {
        let mut dispatcher = InlineDispatcher::new(2);
        dispatcher.submit(request(0, Arc::new(Sleepy), &[])).unwrap();
        assert_eq!(dispatcher.in_flight(), 1);
        assert_eq!(dispatcher.available(), 1);

        let completions = dispatcher.poll().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].key.index, 0);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
