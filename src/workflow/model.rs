//! Workflow Data Model
//!
//! Core data structures describing a workflow: its task template, retry
//! policy and definition-scoped parameters.
//!
//! # Example YAML Format
//!
//! ```yaml
//! tasks:
//!   - id: fetch
//!     action: fetch
//!     params:
//!       source: "https://example.org/{dataset}_{year-month}.csv"
//!       destination: "{work_dir}/{dataset}_{year-month}.csv"
//!
//!   - id: publish
//!     action: publish
//!     params:
//!       source: "{work_dir}/{dataset}_{year-month}.csv"
//!       bucket: "{bucket}"
//!       object_key: "raw/{dataset}/{year}/{dataset}_{year-month}.csv"
//!     retry:
//!       max_retries: 3
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schedule::Schedule;

/// Upper bound on a single backoff delay.
const MAX_BACKOFF_SECS: u64 = 365 * 24 * 3600;

/// How often, and how patiently, a failed task is retried.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry, in seconds.
    pub delay_secs: u64,

    /// Double the delay after each failed retry.
    pub exponential: bool,

    /// Cap for exponential delays, in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay_secs: 300,
            exponential: false,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_secs: u64) -> Self {
        Self {
            max_retries,
            delay_secs,
            ..Self::default()
        }
    }

    pub fn with_exponential(mut self, max_delay_secs: u64) -> Self {
        self.exponential = true;
        self.max_delay_secs = max_delay_secs;
        self
    }

    /// Total attempts allowed, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let secs = if self.exponential {
            let factor = 2u64.saturating_pow(retry.saturating_sub(1));
            self.delay_secs
                .saturating_mul(factor)
                .min(self.max_delay_secs)
        } else {
            self.delay_secs
        };
        Duration::seconds(secs.min(MAX_BACKOFF_SECS) as i64)
    }
}

fn scalar_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Deserializes a mapping whose values may be any YAML scalar into strings.
/// A sequence of scalars becomes one item per line.
pub(crate) fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::Array(items) => items
                        .into_iter()
                        .map(scalar_string)
                        .collect::<Option<Vec<_>>>()
                        .map(|items| items.join("\n")),
                    other => scalar_string(other),
                };
                text.map(|text| (key.clone(), text)).ok_or_else(|| {
                    de::Error::custom(format!(
                        "parameter '{}' must be a scalar or a list of scalars",
                        key
                    ))
                })
            })
            .collect(),
        _ => Err(de::Error::custom("expected a mapping of parameters")),
    }
}

fn trimmed<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(s.trim().to_string())
}

/// Deserializes `depends_on`: absent means "previous task", a string or a
/// list names upstream tasks, `null` or `[]` means none.
fn optional_single_or_vec<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Some(Vec::new())),
        Value::String(s) if s.trim().is_empty() => Ok(Some(Vec::new())),
        Value::String(s) => Ok(Some(vec![s.trim().to_string()])),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(de::Error::custom("expected string in array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        _ => Err(de::Error::custom("expected string or array of strings")),
    }
}

/// One task of a workflow template.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TaskEntry {
    /// Identifier, unique within the template.
    #[serde(deserialize_with = "trimmed")]
    pub id: String,

    /// Name of a registered task action.
    #[serde(deserialize_with = "trimmed")]
    pub action: String,

    /// Parameter templates handed to the action after substitution.
    #[serde(default, deserialize_with = "string_map")]
    pub params: BTreeMap<String, String>,

    /// Upstream task ids. `None` means the previous entry.
    #[serde(default, deserialize_with = "optional_single_or_vec")]
    pub depends_on: Option<Vec<String>>,

    /// Overrides the workflow retry policy for this task.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl TaskEntry {
    /// Creates a new entry.
    ///
    /// # Example
    ///
    /// ```
    /// use ingestrunner::workflow::TaskEntry;
    ///
    /// let entry = TaskEntry::new("publish", "publish")
    ///     .with_param("source", "{local_file}")
    ///     .with_param("object_key", "raw/{dataset}/{year}/{dataset}_{year-month}.csv")
    ///     .depends_on("fetch");
    /// ```
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            action: action.into().trim().to_string(),
            params: BTreeMap::new(),
            depends_on: None,
            retry: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.params.insert(key.into(), template.into());
        self
    }

    /// Adds an explicit upstream dependency.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on
            .get_or_insert_with(Vec::new)
            .push(task_id.into());
        self
    }

    /// Marks the entry as having no upstream tasks.
    pub fn without_dependencies(mut self) -> Self {
        self.depends_on = Some(Vec::new());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Ordered task entries. Indices are stable and identify tasks at runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskTemplate {
    entries: Vec<TaskEntry>,
}

impl TaskTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<TaskEntry>) -> Self {
        Self { entries }
    }

    pub fn with_entry(mut self, entry: TaskEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn get(&self, index: usize) -> Option<&TaskEntry> {
        self.entries.get(index)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskEntry> {
        self.entries.iter()
    }

    /// Upstream task ids of the entry at `index`, with the linear-chain
    /// default applied.
    pub fn upstream_ids(&self, index: usize) -> Vec<&str> {
        match self.entries.get(index) {
            Some(TaskEntry {
                depends_on: Some(ids),
                ..
            }) => ids.iter().map(String::as_str).collect(),
            Some(_) if index > 0 => vec![self.entries[index - 1].id.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved dependency edges of a validated template, by entry index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGraph {
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    pub(crate) fn new(upstream: Vec<Vec<usize>>, order: Vec<usize>) -> Self {
        let mut downstream = vec![Vec::new(); upstream.len()];
        for (index, parents) in upstream.iter().enumerate() {
            for &parent in parents {
                downstream[parent].push(index);
            }
        }
        Self {
            upstream,
            downstream,
            order,
        }
    }

    pub fn upstream(&self, index: usize) -> &[usize] {
        self.upstream.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn downstream(&self, index: usize) -> &[usize] {
        self.downstream.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Topological order of entry indices.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Entries with no upstream tasks.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.upstream.len())
            .filter(|&i| self.upstream[i].is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }
}

/// A complete workflow: schedule, task template and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub schedule: Schedule,
    pub template: TaskTemplate,

    /// Default retry policy for entries without an override.
    pub retry: RetryPolicy,

    pub tags: BTreeSet<String>,

    /// Definition-scoped parameters available to every task template.
    pub params: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, schedule: Schedule, template: TaskTemplate) -> Self {
        Self {
            name: name.into().trim().to_string(),
            schedule,
            template,
            retry: RetryPolicy::default(),
            tags: BTreeSet::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Effective retry policy of the entry at `index`.
    pub fn retry_policy_for(&self, index: usize) -> RetryPolicy {
        self.template
            .get(index)
            .and_then(|entry| entry.retry)
            .unwrap_or(self.retry)
    }
}
