use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::domain::{
    AdapterError, Clock, PowerRecord, RecordScale, TaskStatus, CONSUMPTION_KEY, PRODUCTION_KEY,
};
use crate::pv::PvPredictor;

/// Whole-house power meter
#[async_trait]
pub trait PowerMeter: Send + Sync {
    async fn read(&self, scale: RecordScale) -> Result<PowerRecord, AdapterError>;
}

/// Meter substitute built from the PV model.
///
/// Production is the clear-sky estimate; consumption is the configured base
/// load plus the nominal draw of every task currently reported running.
/// Serves as the primary meter in `sim` mode and as the fail-safe source
/// when the real meter goes stale.
pub struct SimulatedPowerMeter {
    predictor: Arc<PvPredictor>,
    clock: Arc<dyn Clock>,
    base_power_kw: f64,
    statuses: Mutex<Option<watch::Receiver<Vec<TaskStatus>>>>,
}

impl SimulatedPowerMeter {
    pub fn new(predictor: Arc<PvPredictor>, clock: Arc<dyn Clock>, base_power_kw: f64) -> Self {
        Self {
            predictor,
            clock,
            base_power_kw,
            statuses: Mutex::new(None),
        }
    }

    /// Wire in the scheduler's status feed so running tasks show up as load
    pub fn attach_statuses(&self, rx: watch::Receiver<Vec<TaskStatus>>) {
        *self.statuses.lock().unwrap() = Some(rx);
    }

    fn running_statuses(&self) -> Vec<TaskStatus> {
        self.statuses
            .lock()
            .unwrap()
            .as_ref()
            .map(|rx| {
                rx.borrow()
                    .iter()
                    .filter(|s| s.running)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PowerMeter for SimulatedPowerMeter {
    async fn read(&self, _scale: RecordScale) -> Result<PowerRecord, AdapterError> {
        let now = self.clock.now();
        let production = self.predictor.power_at(now, None, None).await;
        let mut record = PowerRecord::new(now).with_channel(PRODUCTION_KEY, production);
        let mut consumption = self.base_power_kw;
        for status in self.running_statuses() {
            consumption += status.nominal_power_kw;
            record.set(&status.id, status.nominal_power_kw);
        }
        record.set(CONSUMPTION_KEY, consumption);
        Ok(record)
    }
}

/// Replays a queue of prepared records; empty queue reads time out.
/// Backs the integration scenarios.
pub struct ScriptedPowerMeter {
    records: Mutex<VecDeque<PowerRecord>>,
}

impl ScriptedPowerMeter {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, record: PowerRecord) {
        self.records.lock().unwrap().push_back(record);
    }
}

impl Default for ScriptedPowerMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerMeter for ScriptedPowerMeter {
    async fn read(&self, _scale: RecordScale) -> Result<PowerRecord, AdapterError> {
        self.records
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(AdapterError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[tokio::test]
    async fn test_scripted_meter_replays_in_order() {
        let meter = ScriptedPowerMeter::new();
        let ts = FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 21, 12, 0, 0)
            .unwrap();
        meter.enqueue(PowerRecord::new(ts).with_channel(PRODUCTION_KEY, 1.0));
        meter.enqueue(
            PowerRecord::new(ts + chrono::Duration::minutes(1)).with_channel(PRODUCTION_KEY, 2.0),
        );

        let first = meter.read(RecordScale::Minute).await.unwrap();
        assert_eq!(first.production(), 1.0);
        let second = meter.read(RecordScale::Minute).await.unwrap();
        assert_eq!(second.production(), 2.0);
        assert!(meter.read(RecordScale::Minute).await.is_err());
    }
}
