use async_trait::async_trait;
use std::sync::Mutex;

use crate::domain::AdapterError;

/// Vehicle state-of-charge source (OBD link, vendor API, ...)
#[async_trait]
pub trait CarSensor: Send + Sync {
    /// State of charge in percent
    async fn state_of_charge(&self) -> Result<f64, AdapterError>;
}

pub struct SimulatedCarSensor {
    soc: Mutex<f64>,
}

impl SimulatedCarSensor {
    pub fn new(soc_percent: f64) -> Self {
        Self {
            soc: Mutex::new(soc_percent),
        }
    }

    pub fn set_soc(&self, soc_percent: f64) {
        *self.soc.lock().unwrap() = soc_percent.clamp(0.0, 100.0);
    }
}

#[async_trait]
impl CarSensor for SimulatedCarSensor {
    async fn state_of_charge(&self) -> Result<f64, AdapterError> {
        Ok(*self.soc.lock().unwrap())
    }
}
