use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::domain::record::PowerRecord;

/// Channel noise floors applied to every record entering the window
#[derive(Debug, Clone, Default)]
pub struct Thresholds {
    per_key: HashMap<String, f64>,
    default: f64,
}

impl Thresholds {
    pub fn new(per_key: HashMap<String, f64>, default: f64) -> Self {
        Self { per_key, default }
    }

    pub fn for_key(&self, key: &str) -> f64 {
        self.per_key.get(key).copied().unwrap_or(self.default)
    }
}

/// The slice of a task the estimators need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub id: String,
    pub keys: Vec<String>,
    pub nominal_power: f64,
}

impl TaskProfile {
    pub fn usage(&self, record: &PowerRecord) -> f64 {
        record.usage(&self.keys)
    }
}

/// Bounded, strictly time-ordered sequence of the most recent power records.
///
/// Mutated only by the scheduler tick; observers get copies. Both ratio
/// estimators are pure functions of the window contents.
pub struct PowerWindow {
    size: usize,
    thresholds: Thresholds,
    records: VecDeque<PowerRecord>,
}

impl PowerWindow {
    pub fn new(size: usize, thresholds: Thresholds) -> Self {
        Self {
            size: size.max(1),
            thresholds,
            records: VecDeque::with_capacity(size.max(1)),
        }
    }

    /// Append a record, evicting the oldest when full. Out-of-order records
    /// are dropped to keep the strict time ordering invariant.
    pub fn push(&mut self, mut record: PowerRecord) {
        if let Some(last) = self.records.back() {
            if record.timestamp <= last.timestamp {
                return;
            }
        }
        record.apply_thresholds(|key| self.thresholds.for_key(key));
        if self.records.len() == self.size {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&PowerRecord> {
        self.records.back()
    }

    /// Read-only copy for observers
    pub fn snapshot(&self) -> Vec<PowerRecord> {
        self.records.iter().cloned().collect()
    }

    /// Power the task's channels draw in the latest record
    pub fn power_used_by(&self, task: &TaskProfile) -> f64 {
        self.latest().map(|r| task.usage(r)).unwrap_or(0.0)
    }

    /// Fraction of `task.nominal_power` the production would cover if the
    /// task started right now, judged on the latest record only.
    ///
    /// Tasks in `ignore` have their draw removed from consumption entirely;
    /// tasks in `minimum` are assumed to shrink to their nominal power, so
    /// only the excess above nominal is credited back.
    pub fn available_for(
        &self,
        task: &TaskProfile,
        minimum: &[&TaskProfile],
        ignore: &[&TaskProfile],
    ) -> f64 {
        let record = match self.latest() {
            Some(r) => r,
            None => return 0.0,
        };
        if task.nominal_power <= 0.0 {
            return 0.0;
        }
        let mut consumption = record.consumption();
        for other in ignore {
            consumption -= other.usage(record);
        }
        for other in minimum {
            consumption -= (other.usage(record) - other.nominal_power).max(0.0);
        }
        let available = record.production() - consumption;
        (available / task.nominal_power).max(0.0)
    }

    /// Fraction of the energy the task drew over the window that was covered
    /// by production at the moment it was drawn.
    ///
    /// Per record, production is first consumed by everything that is not
    /// this task; what remains (clipped at the task's own draw) counts as
    /// covered. Tasks in `minimize` are accounted at their nominal power in
    /// records where they were drawing; tasks in `ignore` are removed.
    /// Returns 0 when the task drew nothing anywhere in the window.
    pub fn covered_by_production(
        &self,
        task: &TaskProfile,
        minimize: &[&TaskProfile],
        ignore: &[&TaskProfile],
    ) -> f64 {
        let mut total = 0.0;
        let mut covered = 0.0;
        for record in &self.records {
            let task_power = task.usage(record);
            if task_power <= 0.0 {
                continue;
            }
            let mut consumption = record.consumption();
            for other in ignore {
                consumption -= other.usage(record);
            }
            for other in minimize {
                let usage = other.usage(record);
                if usage > 0.0 {
                    consumption += other.nominal_power - usage;
                }
            }
            let other_consumption = (consumption - task_power).max(0.0);
            let attributable = (record.production() - other_consumption).max(0.0);
            covered += attributable.min(task_power);
            total += task_power;
        }
        if total <= 0.0 {
            return 0.0;
        }
        (covered / total).max(0.0)
    }
}
