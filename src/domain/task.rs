use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::error::AdapterError;
use super::record::PowerRecord;

/// Task priority levels, totally ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Background,
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const MIN: Priority = Priority::Background;
    pub const MAX: Priority = Priority::Urgent;
    pub const LEVELS: usize = 5;

    /// Next level up, saturating at Urgent
    pub fn raised(self) -> Priority {
        match self {
            Priority::Background => Priority::Low,
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High | Priority::Urgent => Priority::Urgent,
        }
    }

    /// Level from a zero-based index, clamped
    pub fn from_index(index: usize) -> Priority {
        match index {
            0 => Priority::Background,
            1 => Priority::Low,
            2 => Priority::Medium,
            3 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Background => "BACKGROUND",
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        };
        write!(f, "{s}")
    }
}

/// Uniform contract every appliance adapter implements.
///
/// Identity, priority, nominal power, channel keys and the auto-adjust flag
/// are local state and answer synchronously. Everything touching the device
/// may block or fail; those operations are async and bounded by the
/// scheduler's per-call timeout.
///
/// `start` and `stop` are idempotent and return quickly; the device effect
/// may be asynchronous. A task that declines to stop must answer
/// `is_stoppable() == false` instead of ignoring `stop`.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable identifier the task registered under
    fn id(&self) -> &str;

    /// Current priority; tasks recompute it in `adjust_priority`
    fn priority(&self) -> Priority;

    /// Smallest continuous draw (kW) the appliance needs to make progress
    fn nominal_power(&self) -> f64;

    /// Channel keys this task owns in a power record
    fn keys(&self) -> &[String];

    /// True when the task voluntarily scales up to absorb surplus
    fn auto_adjust(&self) -> bool {
        false
    }

    /// Recompute priority from device and planner state
    async fn adjust_priority(&self) -> Result<(), AdapterError>;

    /// Would a `start()` now actually cause device consumption?
    async fn is_runnable(&self) -> Result<bool, AdapterError>;

    /// Actual device state, never a cached intent
    async fn is_running(&self) -> Result<bool, AdapterError>;

    /// False while a minimum-run-time or safety lock-out holds
    async fn is_stoppable(&self) -> Result<bool, AdapterError>;

    /// Is the supplied coverage ratio acceptable for starting or continuing?
    async fn meet_running_criteria(&self, ratio: f64, power: f64) -> Result<bool, AdapterError>;

    async fn start(&self) -> Result<(), AdapterError>;

    async fn stop(&self) -> Result<(), AdapterError>;

    /// Push a new set-point from the latest record; no-op unless auto-adjust
    async fn adjust(&self, record: &PowerRecord) -> Result<(), AdapterError> {
        let _ = record;
        Ok(())
    }

    /// One-line status string
    async fn desc(&self) -> String;

    /// Power drawn by this task's channels in `record`
    fn usage(&self, record: &PowerRecord) -> f64 {
        record.usage(self.keys())
    }
}

/// Per-task status published to observers on every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub priority: Priority,
    pub nominal_power_kw: f64,
    pub auto_adjust: bool,
    pub running: bool,
    pub runnable: bool,
    pub desc: String,
}

/// Total order on tasks: priority first, then the auto-adjust tie-break,
/// then identity. When two tasks share a priority the non-adjustable one is
/// the more important: it is considered first for starting and the
/// adjustable one absorbs what is left.
pub fn cmp_importance(
    a: (Priority, bool, &str),
    b: (Priority, bool, &str),
) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| b.2.cmp(a.2))
}
