//! Workflow Validation
//!
//! Everything that can be known about a definition before it runs is
//! checked here, at registration:
//! - Schedule boundaries and concurrency bound
//! - Task ids, actions and required parameters
//! - Placeholders against the fields a window will provide
//! - Declared input formats against what the action accepts
//! - Dependency references and cycles (Kahn's algorithm)

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use log::{debug, info};

use super::model::{TaskGraph, WorkflowDefinition};
use super::template::{placeholders, TemplateError};
use crate::actions::ActionRegistry;
use crate::error::ConfigError;
use crate::schedule::WINDOW_FIELDS;

/// Extension of the file a template names, when it is written out
/// literally rather than produced by a placeholder.
fn literal_extension(template: &str) -> Option<String> {
    let file_name = template.rsplit('/').next()?;
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('{') || ext.contains('}') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn check_placeholders(
    def: &WorkflowDefinition,
    scope: &str,
    params: &BTreeMap<String, String>,
    known: &BTreeSet<&str>,
) -> Result<(), ConfigError> {
    for (param, template) in params {
        let template_error = |source: TemplateError| ConfigError::Template {
            workflow: def.name.clone(),
            scope: scope.to_string(),
            param: param.clone(),
            source,
        };
        for name in placeholders(template).map_err(template_error)? {
            if !known.contains(name.as_str()) {
                return Err(template_error(TemplateError::UnknownField(name)));
            }
        }
    }
    Ok(())
}

fn validate_schedule(def: &WorkflowDefinition) -> Result<(), ConfigError> {
    let schedule = &def.schedule;
    if let Some(end) = schedule.end {
        if schedule.start > end {
            return Err(ConfigError::InvalidBoundaries {
                workflow: def.name.clone(),
                start: schedule.start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
    }
    if schedule.max_active_runs == 0 {
        return Err(ConfigError::InvalidConcurrency(def.name.clone()));
    }
    Ok(())
}

/// Validates a definition and returns its dependency graph.
///
/// `variables` are the process variables (`work_dir`, `bucket`) every
/// template may reference.
pub fn validate_definition(
    def: &WorkflowDefinition,
    actions: &ActionRegistry,
    variables: &BTreeMap<String, String>,
) -> Result<TaskGraph, ConfigError> {
    if def.name.trim().is_empty() {
        return Err(ConfigError::EmptyWorkflowName);
    }
    info!(
        "Validating workflow '{}' with {} tasks",
        def.name,
        def.template.len()
    );

    validate_schedule(def)?;

    if def.template.is_empty() {
        return Err(ConfigError::EmptyTemplate(def.name.clone()));
    }

    // Definition parameters see window fields and process variables only.
    let mut known: BTreeSet<&str> = WINDOW_FIELDS.iter().copied().collect();
    known.extend(variables.keys().map(String::as_str));
    if let Some(shadowed) = def.params.keys().find(|k| known.contains(k.as_str())) {
        return Err(ConfigError::InvalidDefinition {
            workflow: def.name.clone(),
            reason: format!("parameter '{}' shadows a built-in field", shadowed),
        });
    }
    check_placeholders(def, "workflow", &def.params, &known)?;
    known.extend(def.params.keys().map(String::as_str));

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for entry in def.template.iter() {
        if entry.id.trim().is_empty() {
            return Err(ConfigError::EmptyTaskId {
                workflow: def.name.clone(),
            });
        }
        if entry.id.trim() != entry.id {
            return Err(ConfigError::InvalidDefinition {
                workflow: def.name.clone(),
                reason: format!("task id '{}' has surrounding whitespace", entry.id),
            });
        }
        if !seen_ids.insert(entry.id.as_str()) {
            return Err(ConfigError::DuplicateTask {
                workflow: def.name.clone(),
                task: entry.id.clone(),
            });
        }

        let action = actions
            .get(&entry.action)
            .ok_or_else(|| ConfigError::UnknownAction {
                workflow: def.name.clone(),
                task: entry.id.clone(),
                action: entry.action.clone(),
            })?;

        for param in action.required_params() {
            let present = entry
                .params
                .get(*param)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !present {
                return Err(ConfigError::MissingParameter {
                    workflow: def.name.clone(),
                    task: entry.id.clone(),
                    param: param.to_string(),
                });
            }
        }

        check_placeholders(def, &entry.id, &entry.params, &known)?;

        let accepted = action.accepted_inputs();
        if !accepted.is_empty() {
            if let Some(source) = entry.params.get("source") {
                if let Some(ext) = literal_extension(source) {
                    if !accepted.contains(&ext.as_str()) {
                        return Err(ConfigError::UnsupportedFormat {
                            workflow: def.name.clone(),
                            task: entry.id.clone(),
                            format: format!(".{}", ext),
                            accepted: accepted
                                .iter()
                                .map(|a| format!(".{}", a))
                                .collect::<Vec<_>>()
                                .join(", "),
                        });
                    }
                } else {
                    debug!(
                        "Task '{}': input format of '{}' is only known at run time",
                        entry.id,
                        Path::new(source).display()
                    );
                }
            }
        }
    }

    let graph = build_graph(def)?;
    info!(
        "Workflow '{}' validated: {} tasks, {} roots",
        def.name,
        graph.len(),
        graph.roots().len()
    );
    Ok(graph)
}

/// Resolves upstream ids to indices and orders the entries topologically.
fn build_graph(def: &WorkflowDefinition) -> Result<TaskGraph, ConfigError> {
    let index_of: HashMap<&str, usize> = def
        .template
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), i))
        .collect();

    let mut upstream: Vec<Vec<usize>> = Vec::with_capacity(def.template.len());
    for (index, entry) in def.template.iter().enumerate() {
        let mut parents = Vec::new();
        for id in def.template.upstream_ids(index) {
            let parent = *index_of
                .get(id)
                .ok_or_else(|| ConfigError::UnknownDependency {
                    workflow: def.name.clone(),
                    task: entry.id.clone(),
                    dependency: id.to_string(),
                })?;
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        upstream.push(parents);
    }

    let order = topological_sort(&upstream)
        .ok_or_else(|| ConfigError::CyclicDependency(def.name.clone()))?;
    debug!(
        "Topological order: {:?}",
        order
            .iter()
            .filter_map(|&i| def.template.get(i).map(|e| e.id.as_str()))
            .collect::<Vec<_>>()
    );

    Ok(TaskGraph::new(upstream, order))
}

/// Kahn's algorithm over entry indices. Returns `None` on a cycle.
/// Ties are broken by index so the order is deterministic.
fn topological_sort(upstream: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); upstream.len()];
    for (index, parents) in upstream.iter().enumerate() {
        for &parent in parents {
            successors[parent].push(index);
        }
    }

    let mut queue: VecDeque<usize> = (0..upstream.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut sorted_order = Vec::with_capacity(upstream.len());

    while let Some(current) = queue.pop_front() {
        sorted_order.push(current);
        for &successor in &successors[current] {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                queue.push_back(successor);
            }
        }
    }

    (sorted_order.len() == upstream.len()).then_some(sorted_order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{CleanupAction, FetchAction, JsonColumnarEncoder, TransformAction};
    use crate::schedule::{Recurrence, Schedule};
    use crate::workflow::model::{TaskEntry, TaskTemplate};
    use crate::workflow::pipelines;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn actions() -> ActionRegistry {
        ActionRegistry::new()
            .with_action(FetchAction)
            .with_action(TransformAction::new(Arc::new(JsonColumnarEncoder)))
            .with_action(CleanupAction)
    }

    fn variables() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("work_dir".to_string(), "/opt/ingest".to_string());
        vars.insert("bucket".to_string(), "lake".to_string());
        vars
    }

    fn schedule() -> Schedule {
        Schedule::new(
            Recurrence::parse("@monthly").unwrap(),
            Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn fetch(id: &str) -> TaskEntry {
        TaskEntry::new(id, "fetch")
            .with_param("source", "https://host/{year-month}.csv")
            .with_param("destination", "{work_dir}/{year-month}.csv")
    }

    fn definition(template: TaskTemplate) -> WorkflowDefinition {
        WorkflowDefinition::new("zones", schedule(), template)
    }

    fn validate(def: &WorkflowDefinition) -> Result<TaskGraph, ConfigError> {
        validate_definition(def, &actions(), &variables())
    }

    #[test]
    fn test_valid_linear_chain() {
        let def = definition(
            TaskTemplate::new()
                .with_entry(fetch("a"))
                .with_entry(fetch("b"))
                .with_entry(fetch("c")),
        );
        let graph = validate(&def).unwrap();
        assert_eq!(graph.order(), &[0, 1, 2]);
        assert_eq!(graph.upstream(2), &[1]);
        assert_eq!(graph.roots(), vec![0]);
    }

    #[test]
    fn test_explicit_dag() {
        let def = definition(
            TaskTemplate::new()
                .with_entry(fetch("join").depends_on("left").depends_on("right"))
                .with_entry(fetch("left").without_dependencies())
                .with_entry(fetch("right").without_dependencies()),
        );
        let graph = validate(&def).unwrap();
        assert_eq!(graph.order(), &[1, 2, 0]);
        assert_eq!(graph.downstream(1), &[0]);
    }

    #[test]
    fn test_empty_template() {
        let err = validate(&definition(TaskTemplate::new())).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTemplate(_)));
    }

    #[test]
    fn test_empty_name() {
        let def = WorkflowDefinition::new("  ", schedule(), TaskTemplate::new().with_entry(fetch("a")));
        assert!(matches!(validate(&def), Err(ConfigError::EmptyWorkflowName)));
    }

    #[test]
    fn test_duplicate_ids() {
        let def = definition(TaskTemplate::new().with_entry(fetch("a")).with_entry(fetch("a")));
        assert!(matches!(
            validate(&def),
            Err(ConfigError::DuplicateTask { task, .. }) if task == "a"
        ));
    }

    #[test]
    fn test_empty_task_id() {
        let def = definition(TaskTemplate::new().with_entry(fetch(" ")));
        assert!(matches!(validate(&def), Err(ConfigError::EmptyTaskId { .. })));
    }

    #[test]
    fn test_padded_task_id() {
        let mut padded = fetch("b");
        padded.id = " a".to_string();
        let def = definition(TaskTemplate::new().with_entry(fetch("a")).with_entry(padded));
        assert!(matches!(validate(&def), Err(ConfigError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_cyclic_dependency() {
        let def = definition(
            TaskTemplate::new()
                .with_entry(fetch("a").depends_on("b"))
                .with_entry(fetch("b")),
        );
        assert!(matches!(validate(&def), Err(ConfigError::CyclicDependency(_))));

        let self_loop = definition(TaskTemplate::new().with_entry(fetch("a").depends_on("a")));
        assert!(matches!(validate(&self_loop), Err(ConfigError::CyclicDependency(_))));
    }

    #[test]
    fn test_unknown_dependency() {
        let def = definition(TaskTemplate::new().with_entry(fetch("a").depends_on("ghost")));
        assert!(matches!(
            validate(&def),
            Err(ConfigError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_unknown_action() {
        let def = definition(TaskTemplate::new().with_entry(TaskEntry::new("load", "bulk_load")));
        assert!(matches!(validate(&def), Err(ConfigError::UnknownAction { .. })));
    }

    #[test]
    fn test_missing_required_parameter() {
        let def = definition(
            TaskTemplate::new()
                .with_entry(TaskEntry::new("a", "fetch").with_param("source", "https://x/y.csv")),
        );
        assert!(matches!(
            validate(&def),
            Err(ConfigError::MissingParameter { param, .. }) if param == "destination"
        ));
    }

    #[test]
    fn test_unknown_placeholder() {
        let def = definition(TaskTemplate::new().with_entry(
            fetch("a").with_param("destination", "{work_dir}/{quarter}.csv"),
        ));
        let err = validate(&def).unwrap_err();
        assert!(matches!(err, ConfigError::Template { ref scope, .. } if scope == "a"));
        assert!(err.to_string().contains("{quarter}"));
    }

    #[test]
    fn test_malformed_placeholder() {
        let def = definition(
            TaskTemplate::new().with_entry(fetch("a").with_param("destination", "{work_dir/x.csv")),
        );
        assert!(matches!(validate(&def), Err(ConfigError::Template { .. })));
    }

    #[test]
    fn test_definition_params_are_known_fields() {
        let def = definition(TaskTemplate::new().with_entry(
            fetch("a").with_param("destination", "{work_dir}/{dataset}_{year-month}.csv"),
        ))
        .with_param("dataset", "zone_data");
        assert!(validate(&def).is_ok());
    }

    #[test]
    fn test_definition_params_cannot_chain_or_shadow() {
        let chained = definition(TaskTemplate::new().with_entry(fetch("a")))
            .with_param("dataset", "zones")
            .with_param("file", "{dataset}.csv");
        assert!(matches!(
            validate(&chained),
            Err(ConfigError::Template { ref scope, .. }) if scope == "workflow"
        ));

        let shadow = definition(TaskTemplate::new().with_entry(fetch("a"))).with_param("year", "2020");
        assert!(matches!(validate(&shadow), Err(ConfigError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_declared_non_csv_transform_input() {
        let def = definition(TaskTemplate::new().with_entry(
            TaskEntry::new("convert", "transform")
                .with_param("source", "{work_dir}/trips_{year-month}.parquet")
                .with_param("destination", "{work_dir}/trips_{year-month}.json"),
        ));
        let err = validate(&def).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat { ref format, .. } if format == ".parquet"));
    }

    #[test]
    fn test_placeholder_input_format_deferred() {
        let def = definition(TaskTemplate::new().with_entry(
            TaskEntry::new("convert", "transform")
                .with_param("source", "{work_dir}/trips_{year-month}.{input_format}")
                .with_param("destination", "{work_dir}/trips.json"),
        ))
        .with_param("input_format", "json");
        assert!(validate(&def).is_ok());
    }

    #[test]
    fn test_invalid_boundaries_and_concurrency() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let backwards = Schedule::new(Recurrence::parse("@daily").unwrap(), start)
            .with_end(Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap());
        let def = WorkflowDefinition::new("w", backwards, TaskTemplate::new().with_entry(fetch("a")));
        assert!(matches!(validate(&def), Err(ConfigError::InvalidBoundaries { .. })));

        let zero = Schedule::new(Recurrence::parse("@daily").unwrap(), start).with_max_active_runs(0);
        let def = WorkflowDefinition::new("w", zero, TaskTemplate::new().with_entry(fetch("a")));
        assert!(matches!(validate(&def), Err(ConfigError::InvalidConcurrency(_))));
    }

    #[test]
    fn test_pipeline_actions_must_be_registered() {
        let template = pipelines::download_convert_upload(
            "https://host/taxi_zone_lookup.csv",
            pipelines::DEFAULT_LOCAL_CSV,
            pipelines::DEFAULT_LOCAL_FILE,
            pipelines::DEFAULT_OBJECT_KEY,
        );
        let def = definition(template)
            .with_param("dataset", "zone_data")
            .with_param("format", "json");
        // no publish action registered in this test registry
        let err = validate(&def).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAction { ref action, .. } if action == "publish"));
    }

    #[test]
    fn test_literal_extension() {
        assert_eq!(literal_extension("{work_dir}/a_{year}.CSV"), Some("csv".to_string()));
        assert_eq!(literal_extension("{work_dir}/a.{format}"), None);
        assert_eq!(literal_extension("{local_csv}"), None);
        assert_eq!(literal_extension("/data.v1/file"), None);
    }

    #[test]
    fn test_topological_sort_multiple_roots() {
        let order = topological_sort(&[vec![], vec![], vec![0, 1]]).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(topological_sort(&[vec![1], vec![0]]).is_none());
    }
}
