use async_trait::async_trait;
use std::sync::Mutex;

use crate::domain::AdapterError;

/// Pool water thermometer
#[async_trait]
pub trait PoolSensor: Send + Sync {
    /// Water temperature in °F
    async fn water_temperature(&self) -> Result<f64, AdapterError>;
}

pub struct SimulatedPoolSensor {
    temperature: Mutex<Option<f64>>,
}

impl SimulatedPoolSensor {
    pub fn new(temperature_f: f64) -> Self {
        Self {
            temperature: Mutex::new(Some(temperature_f)),
        }
    }

    /// Simulate a dead thermometer; readings fail until a new value is set
    pub fn go_offline(&self) {
        *self.temperature.lock().unwrap() = None;
    }

    pub fn set_temperature(&self, temperature_f: f64) {
        *self.temperature.lock().unwrap() = Some(temperature_f);
    }
}

#[async_trait]
impl PoolSensor for SimulatedPoolSensor {
    async fn water_temperature(&self) -> Result<f64, AdapterError> {
        self.temperature
            .lock()
            .unwrap()
            .ok_or_else(|| AdapterError::transport("pool thermometer offline"))
    }
}
