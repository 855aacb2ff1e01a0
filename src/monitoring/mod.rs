//! Run Monitoring Module
//!
//! Provides the per-run execution timeline used for duration reports.
//!
//! # Components
//!
//! - [`RunTimeline`]: task dispatch/outcome events and a text Gantt chart

pub mod timeline;

pub use timeline::{EventType, RunTimeline, TimelineEvent};
