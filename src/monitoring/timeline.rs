//! Run Timeline
//!
//! Records when each task of a run was dispatched and how each attempt
//! ended, for duration reports and a text Gantt chart printed when the
//! run finishes.
//!
//! Timestamps come from the orchestrator's clock rather than the wall
//! clock so that ticks replayed in tests produce identical timelines.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// An attempt was handed to a worker
    Dispatched,
    /// The attempt succeeded
    Succeeded,
    /// The attempt failed and a retry is scheduled
    RetryScheduled,
    /// The attempt failed and no retries remain
    Exhausted,
}

impl EventType {
    fn ends_attempt(self) -> bool {
        !matches!(self, EventType::Dispatched)
    }
}

/// A single event in a run timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub task_id: String,
    pub event_type: EventType,
    /// 1-based attempt number the event belongs to
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the task events of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTimeline {
    events: Vec<TimelineEvent>,
    created_at: DateTime<Utc>,
}

impl RunTimeline {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            created_at,
        }
    }

    pub fn add_event(
        &mut self,
        task_id: impl Into<String>,
        event_type: EventType,
        attempt: u32,
        timestamp: DateTime<Utc>,
    ) {
        self.events.push(TimelineEvent {
            task_id: task_id.into(),
            event_type,
            attempt,
            timestamp,
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time between run creation and the last recorded event.
    pub fn elapsed(&self) -> Duration {
        self.events
            .last()
            .map(|e| e.timestamp - self.created_at)
            .unwrap_or_else(Duration::zero)
    }

    /// Time spent executing each task, summed over its attempts.
    pub fn durations(&self) -> BTreeMap<String, Duration> {
        let mut starts: BTreeMap<(&str, u32), DateTime<Utc>> = BTreeMap::new();
        let mut durations: BTreeMap<String, Duration> = BTreeMap::new();

        for event in &self.events {
            let key = (event.task_id.as_str(), event.attempt);
            if event.event_type.ends_attempt() {
                if let Some(start) = starts.remove(&key) {
                    *durations
                        .entry(event.task_id.clone())
                        .or_insert_with(Duration::zero) += event.timestamp - start;
                }
            } else {
                starts.insert(key, event.timestamp);
            }
        }

        durations
    }

    /// Renders one bar per attempt, scaled to 50 columns.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nRun Timeline:\n\n");

        let total = self.elapsed().num_milliseconds();
        if total <= 0 {
            return output;
        }
        let scale = 50.0 / total as f64;

        let mut starts: BTreeMap<(&str, u32), i64> = BTreeMap::new();
        let mut bars: Vec<(String, i64, i64, EventType)> = Vec::new();

        for event in &self.events {
            let offset = (event.timestamp - self.created_at).num_milliseconds();
            let key = (event.task_id.as_str(), event.attempt);
            if event.event_type.ends_attempt() {
                if let Some(start) = starts.remove(&key) {
                    let label = if event.attempt > 1 {
                        format!("{}#{}", event.task_id, event.attempt)
                    } else {
                        event.task_id.clone()
                    };
                    bars.push((label, start, offset, event.event_type));
                }
            } else {
                starts.insert(key, offset);
            }
        }
        bars.sort_by_key(|(_, start, _, _)| *start);

        for (label, start, end, outcome) in bars {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;
            let fill = if outcome == EventType::Succeeded { "#" } else { "x" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&fill.repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} s)\n",
                truncate(&label, 12),
                bar,
                (end - start) / 1000
            ));
        }

        output.push_str(&format!("\nTotal: {} s\n", total / 1000));
        output
    }
}

/// Truncates a label to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
