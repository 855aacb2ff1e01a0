//! Workflow Parser
//!
//! Loads workflow definitions from YAML. One file may declare any number
//! of workflows; each declares either a `pipeline` shorthand or an
//! explicit `tasks` list.
//!
//! ```yaml
//! workflows:
//!   - name: yellow_taxi_data
//!     schedule: "0 6 2 * *"
//!     start: 2019-01-01
//!     end: 2020-12-31
//!     catchup: true
//!     max_active_runs: 3
//!     tags: [taxi]
//!     params:
//!       dataset: yellow_tripdata
//!       format: parquet
//!     pipeline:
//!       kind: download_upload
//!       url: "https://d37ci6vzurychx.cloudfront.net/trip-data/{dataset}_{year-month}.parquet"
//! ```
//!
//! `start` also accepts a relative form, `-<n>d` or `-<n>h`, resolved
//! against the load time (`-1d` is yesterday at midnight UTC).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Deserialize;

use super::model::{string_map, RetryPolicy, TaskEntry, TaskTemplate, WorkflowDefinition};
use super::pipelines::Pipeline;
use crate::error::ConfigError;
use crate::schedule::{parse_timestamp, Recurrence, Schedule};

/// Largest `<n>` accepted in a relative start boundary.
const MAX_RELATIVE_AMOUNT: i64 = 100_000;

fn default_max_active_runs() -> usize {
    1
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct WorkflowFile {
    #[serde(default)]
    workflows: Vec<RawWorkflow>,
}

/// A workflow as written in YAML, before validation.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawWorkflow {
    pub name: String,

    /// Cron expression, preset or `@every` interval
    pub schedule: String,

    pub start: String,

    #[serde(default)]
    pub end: Option<String>,

    #[serde(default)]
    pub catchup: bool,

    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, deserialize_with = "string_map")]
    pub params: BTreeMap<String, String>,

    #[serde(default)]
    pub pipeline: Option<Pipeline>,

    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

/// Resolves `-<n>d` / `-<n>h` relative to `now`, or parses an absolute
/// timestamp.
fn resolve_start(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
    let trimmed = text.trim();
    let Some(relative) = trimmed.strip_prefix('-') else {
        return parse_timestamp(trimmed);
    };

    let invalid = || ConfigError::InvalidTimestamp {
        value: trimmed.to_string(),
    };
    let split = relative.len().saturating_sub(1);
    let (amount, unit) = relative.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if !(0..=MAX_RELATIVE_AMOUNT).contains(&amount) {
        return Err(invalid());
    }

    match unit {
        "d" => (now - Duration::days(amount))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .ok_or_else(invalid),
        "h" => Ok(now - Duration::hours(amount)),
        _ => Err(invalid()),
    }
}

impl RawWorkflow {
    /// Builds the definition this entry describes. Structural checks beyond
    /// parsing happen at registration.
    pub fn into_definition(self, now: DateTime<Utc>) -> Result<WorkflowDefinition, ConfigError> {
        let recurrence =
            Recurrence::parse(&self.schedule).map_err(|source| ConfigError::InvalidRecurrence {
                workflow: self.name.clone(),
                expression: self.schedule.clone(),
                source,
            })?;

        let start = resolve_start(&self.start, now)?;
        let mut schedule = Schedule::new(recurrence, start)
            .with_catchup(self.catchup)
            .with_max_active_runs(self.max_active_runs);
        if let Some(end) = &self.end {
            schedule = schedule.with_end(parse_timestamp(end)?);
        }

        let template = match (self.pipeline, self.tasks.is_empty()) {
            (Some(_), false) => {
                return Err(ConfigError::InvalidDefinition {
                    workflow: self.name,
                    reason: "declare either 'pipeline' or 'tasks', not both".to_string(),
                })
            }
            (Some(pipeline), true) => {
                debug!("Workflow '{}' uses pipeline '{}'", self.name, pipeline.kind());
                pipeline.template()
            }
            (None, _) => TaskTemplate::from_entries(self.tasks),
        };

        let mut definition = WorkflowDefinition::new(self.name, schedule, template);
        if let Some(retry) = self.retry {
            definition = definition.with_retry(retry);
        }
        definition.tags.extend(self.tags);
        definition.params = self.params;
        Ok(definition)
    }
}

/// Parses every workflow in a YAML document.
pub fn parse_workflows(yaml: &str, origin: &str) -> Result<Vec<WorkflowDefinition>, ConfigError> {
    parse_workflows_at(yaml, origin, Utc::now())
}

/// Same as [`parse_workflows`], resolving relative start boundaries
/// against `now`.
pub fn parse_workflows_at(
    yaml: &str,
    origin: &str,
    now: DateTime<Utc>,
) -> Result<Vec<WorkflowDefinition>, ConfigError> {
    let file: WorkflowFile = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Yaml {
        origin: origin.to_string(),
        source,
    })?;

    info!("Parsed {} workflows from {}", file.workflows.len(), origin);
    file.workflows
        .into_iter()
        .map(|raw| raw.into_definition(now))
        .collect()
}

/// Loads workflow definitions from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use ingestrunner::workflow::load_workflows;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definitions = load_workflows("demos/taxi.yaml")?;
///     println!("Loaded {} workflows", definitions.len());
///     Ok(())
/// }
/// ```
pub fn load_workflows(path: impl AsRef<Path>) -> Result<Vec<WorkflowDefinition>, ConfigError> {
    let path = path.as_ref();
    info!("Loading workflows from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_workflows(&yaml_content, &path.display().to_string())
}
