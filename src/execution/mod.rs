//! Workflow Execution Module
//!
//! Turns registered workflows into runs and drives them to completion.
//!
//! # Architecture
//!
//! - [`instance`]: Task instance state machine
//! - [`run`]: One template instantiation bound to a logical window
//! - [`dispatch`]: Worker pools that execute task actions
//! - [`orchestrator`]: The tick-driven control loop

pub mod dispatch;
pub mod instance;
pub mod orchestrator;
pub mod run;

pub use dispatch::{Completion, DispatchRequest, Dispatcher, InlineDispatcher, TaskKey, ThreadDispatcher};
pub use instance::{TaskInstance, TaskState};
pub use orchestrator::{Orchestrator, TickAction, TickReport, DEFAULT_HISTORY_LIMIT};
pub use run::{Run, RunState, TaskOutcome, Trigger};
