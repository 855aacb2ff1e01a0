//! Task Actions
//!
//! A task action is a named, idempotent unit of work. It receives fully
//! resolved string parameters, touches only the resources those parameters
//! name, and reports success or an [`ActionError`]. Actions never retry on
//! their own; retry is the orchestrator's job.
//!
//! # Built-in actions
//!
//! - [`fetch`]: download or copy `source` to `destination`
//! - [`transform`]: re-encode a CSV `source` into a columnar `destination`
//! - [`publish`]: upload `source` to `bucket`/`object_key`
//! - [`cleanup`]: remove local `paths`

pub mod cleanup;
pub mod command;
pub mod fetch;
pub mod publish;
pub mod transform;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::config::{ProcessConfig, StoreBackend};
use crate::error::ActionError;

pub use cleanup::CleanupAction;
pub use fetch::FetchAction;
pub use publish::{GsutilObjectStore, LocalObjectStore, ObjectStore, PublishAction};
pub use transform::{ColumnarEncoder, CommandEncoder, JsonColumnarEncoder, TransformAction};

/// Uniform contract between the orchestrator and a unit of work.
pub trait TaskAction: Send + Sync {
    /// Name workflow definitions use to refer to the action.
    fn name(&self) -> &str;

    /// Parameters every task using this action must declare.
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    /// Lowercase file extensions the `source` parameter may carry.
    /// Empty means any input is accepted.
    fn accepted_inputs(&self) -> &[&'static str] {
        &[]
    }

    fn execute(&self, params: &BTreeMap<String, String>) -> Result<(), ActionError>;
}

/// Looks up a parameter an action cannot run without.
pub fn require<'a>(
    params: &'a BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ActionError::MissingParameter(key.to_string()))
}

/// Named actions available to workflow definitions.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn TaskAction>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in actions wired to the process
    /// configuration.
    pub fn with_defaults(config: &ProcessConfig) -> Self {
        let encoder: Arc<dyn ColumnarEncoder> = match &config.converter {
            Some(command) => Arc::new(CommandEncoder::new(command.clone())),
            None => Arc::new(JsonColumnarEncoder),
        };
        let store: Arc<dyn ObjectStore> = match &config.store {
            StoreBackend::Local(root) => Arc::new(LocalObjectStore::new(root.clone())),
            StoreBackend::Gcs => Arc::new(GsutilObjectStore::default()),
        };

        Self::new()
            .with_action(FetchAction)
            .with_action(TransformAction::new(encoder))
            .with_action(PublishAction::new(store))
            .with_action(CleanupAction)
    }

    pub fn with_action(mut self, action: impl TaskAction + 'static) -> Self {
        self.register(Arc::new(action));
        self
    }

    /// Adds an action, replacing any action with the same name.
    pub fn register(&mut self, action: Arc<dyn TaskAction>) {
        let name = action.name().to_string();
        if self.actions.insert(name.clone(), action).is_some() {
            debug!("Replaced action '{}'", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskAction>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
