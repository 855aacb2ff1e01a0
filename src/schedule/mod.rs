//! Schedules and Window Enumeration
//!
//! A [`Schedule`] combines a [`Recurrence`] with start/end boundaries, a
//! catch-up policy and a concurrency bound, and enumerates the logical
//! windows that are due at a given instant.
//!
//! - [`recurrence`]: cron/preset/interval parsing and occurrence search
//! - [`window`]: the [`LogicalWindow`] type and its substitution fields

pub mod recurrence;
pub mod window;

pub use recurrence::{Recurrence, RecurrenceError};
pub use window::{parse_timestamp, LogicalWindow, WINDOW_FIELDS};

use chrono::{DateTime, Utc};

/// Recurrence plus boundaries, catch-up flag and max active runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub recurrence: Recurrence,
    /// Inclusive start boundary, also the anchor of interval rules.
    pub start: DateTime<Utc>,
    /// Inclusive end boundary.
    pub end: Option<DateTime<Utc>>,
    pub catchup: bool,
    pub max_active_runs: usize,
}

impl Schedule {
    /// Creates a schedule with no end, catch-up disabled and one active run.
    pub fn new(recurrence: Recurrence, start: DateTime<Utc>) -> Self {
        Self {
            recurrence,
            start,
            end: None,
            catchup: false,
            max_active_runs: 1,
        }
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn with_max_active_runs(mut self, max: usize) -> Self {
        self.max_active_runs = max;
        self
    }

    /// The latest instant a window may fall on: `min(now, end)`.
    pub fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.end {
            Some(end) if end < now => end,
            _ => now,
        }
    }

    fn within(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.horizon(now)
    }

    /// First window of the schedule, due or not, ignoring the end boundary.
    pub fn first_window(&self) -> Option<LogicalWindow> {
        self.recurrence
            .at_or_after(self.start, self.start)
            .map(LogicalWindow::new)
    }

    /// Window following `window`, ignoring the end boundary.
    pub fn next_window(&self, window: &LogicalWindow) -> Option<LogicalWindow> {
        self.recurrence
            .after(self.start, window.timestamp())
            .map(LogicalWindow::new)
    }

    /// First due window strictly after `cursor`, or the first due window of
    /// the schedule when there is no cursor.
    pub fn next_due(
        &self,
        cursor: Option<&LogicalWindow>,
        now: DateTime<Utc>,
    ) -> Option<LogicalWindow> {
        let candidate = match cursor {
            Some(window) => self.next_window(window),
            None => self.first_window(),
        }?;
        self.within(candidate.timestamp(), now).then_some(candidate)
    }

    /// Most recent due window, if any.
    pub fn latest_due(&self, now: DateTime<Utc>) -> Option<LogicalWindow> {
        let horizon = self.horizon(now);
        if horizon < self.start {
            return None;
        }
        self.recurrence
            .at_or_before(self.start, horizon)
            .filter(|t| *t >= self.start)
            .map(LogicalWindow::new)
    }

    /// Enumerates every window due at `now`, in increasing order.
    ///
    /// With catch-up enabled this is every occurrence between the start
    /// boundary and `min(now, end)`, inclusive. Without catch-up it is at
    /// most the most recent one.
    pub fn due_windows(&self, now: DateTime<Utc>) -> Vec<LogicalWindow> {
        if !self.catchup {
            return self.latest_due(now).into_iter().collect();
        }

        let mut windows = Vec::new();
        let mut cursor = None;
        while let Some(window) = self.next_due(cursor.as_ref(), now) {
            windows.push(window);
            cursor = Some(window);
        }
        windows
    }
}
