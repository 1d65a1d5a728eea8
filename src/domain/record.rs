use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PRODUCTION_KEY: &str = "production";
pub const CONSUMPTION_KEY: &str = "consumption";

/// Time resolution of a sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordScale {
    Second,
    Minute,
    Hour,
    Day,
}

impl Default for RecordScale {
    fn default() -> Self {
        Self::Minute
    }
}

/// Immutable snapshot of per-channel power readings at a minute boundary.
///
/// Values are kW and non-negative after the noise floor is applied. Every
/// record carries at least a `production` and a `consumption` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerRecord {
    pub timestamp: DateTime<FixedOffset>,
    channels: BTreeMap<String, f64>,
}

impl PowerRecord {
    pub fn new(timestamp: DateTime<FixedOffset>) -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(PRODUCTION_KEY.to_string(), 0.0);
        channels.insert(CONSUMPTION_KEY.to_string(), 0.0);
        Self {
            timestamp,
            channels,
        }
    }

    pub fn with_channel(mut self, key: &str, kw: f64) -> Self {
        self.set(key, kw);
        self
    }

    pub fn set(&mut self, key: &str, kw: f64) {
        self.channels.insert(key.to_string(), kw.max(0.0));
    }

    pub fn get(&self, key: &str) -> f64 {
        self.channels.get(key).copied().unwrap_or(0.0)
    }

    pub fn production(&self) -> f64 {
        self.get(PRODUCTION_KEY)
    }

    pub fn consumption(&self) -> f64 {
        self.get(CONSUMPTION_KEY)
    }

    /// Sum of the given channel keys
    pub fn usage(&self, keys: &[String]) -> f64 {
        keys.iter().map(|k| self.get(k)).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Zero out channel values below their noise floor
    pub fn apply_thresholds(&mut self, threshold_for: impl Fn(&str) -> f64) {
        for (key, value) in self.channels.iter_mut() {
            if *value > 0.0 && *value < threshold_for(key) {
                *value = 0.0;
            }
        }
    }

    /// Total of every channel except production and consumption
    pub fn total_device_power(&self) -> f64 {
        self.channels
            .iter()
            .filter(|(k, _)| k.as_str() != PRODUCTION_KEY && k.as_str() != CONSUMPTION_KEY)
            .map(|(_, v)| v)
            .sum()
    }
}
