//! Workflow Registry
//!
//! An explicit registry built once at process start. Every definition is
//! validated on the way in, so anything the orchestrator reads from here
//! is known to be well formed.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use super::model::{TaskGraph, WorkflowDefinition};
use super::validator::validate_definition;
use crate::actions::ActionRegistry;
use crate::error::ConfigError;

/// A validated definition together with its resolved dependency graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredWorkflow {
    pub definition: WorkflowDefinition,
    pub graph: TaskGraph,
}

impl RegisteredWorkflow {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Registered workflows, keyed by name.
#[derive(Debug, Clone)]
pub struct WorkflowRegistry {
    actions: Arc<ActionRegistry>,
    variables: BTreeMap<String, String>,
    workflows: BTreeMap<String, RegisteredWorkflow>,
}

impl WorkflowRegistry {
    /// Creates an empty registry.
    ///
    /// `variables` are the process variables available to every template.
    pub fn new(actions: Arc<ActionRegistry>, variables: BTreeMap<String, String>) -> Self {
        Self {
            actions,
            variables,
            workflows: BTreeMap::new(),
        }
    }

    /// Validates and stores a definition. Names must be unique.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), ConfigError> {
        if self.workflows.contains_key(&definition.name) {
            return Err(ConfigError::DuplicateWorkflow(definition.name));
        }

        let graph = validate_definition(&definition, &self.actions, &self.variables)?;
        info!(
            "Registered workflow '{}' ({}, catchup: {}, max active runs: {})",
            definition.name,
            definition.schedule.recurrence,
            definition.schedule.catchup,
            definition.schedule.max_active_runs
        );

        self.workflows.insert(
            definition.name.clone(),
            RegisteredWorkflow { definition, graph },
        );
        Ok(())
    }

    /// Registers every definition, stopping at the first invalid one.
    pub fn register_all(
        &mut self,
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<(), ConfigError> {
        definitions
            .into_iter()
            .try_for_each(|definition| self.register(definition))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredWorkflow> {
        self.workflows.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredWorkflow> {
        self.workflows.values()
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::TaskAction;
    use crate::error::ActionError;
    use crate::schedule::{parse_timestamp, Recurrence, Schedule};
    use crate::workflow::model::{TaskEntry, TaskTemplate};

    struct Echo;

    impl TaskAction for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn execute(&self, _params: &BTreeMap<String, String>) -> Result<(), ActionError> {
            Ok(())
        }
    }

    fn registry() -> WorkflowRegistry {
        let actions = ActionRegistry::new().with_action(Echo);
        let mut variables = BTreeMap::new();
        variables.insert("work_dir".to_string(), "/tmp/ingest".to_string());
        WorkflowRegistry::new(Arc::new(actions), variables)
    }

    fn definition(name: &str) -> WorkflowDefinition {
        let schedule = Schedule::new(
            Recurrence::parse("@monthly").unwrap(),
            parse_timestamp("2019-01-01").unwrap(),
        );
        let template = TaskTemplate::new()
            .with_entry(TaskEntry::new("first", "echo").with_param("path", "{work_dir}/{year}"))
            .with_entry(TaskEntry::new("second", "echo"));
        WorkflowDefinition::new(name, schedule, template)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = registry();
        registry.register(definition("green")).unwrap();
        registry.register(definition("yellow")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["green", "yellow"]);

        let registered = registry.get("yellow").unwrap();
        assert_eq!(registered.name(), "yellow");
        assert_eq!(registered.graph.upstream(1), &[0]);
        assert!(registry.get("fhv").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = registry();
        registry.register(definition("zones")).unwrap();
        let err = registry.register(definition("zones")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateWorkflow(name) if name == "zones"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_definition_not_stored() {
        let mut registry = registry();
        let bad = definition("broken").with_param("dataset", "{nope}");
        assert!(registry.register(bad).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_all_stops_at_first_error() {
        let mut registry = registry();
        let result = registry.register_all(vec![
            definition("a"),
            definition("a"),
            definition("b"),
        ]);
        assert!(result.is_err());
        assert_eq!(registry.names(), vec!["a"]);
    }
}
