use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::PoolPumpConfig;
use crate::domain::{AdapterError, Clock, Priority, Task};
use crate::planner::DeadlinePlanner;
use crate::sensor::{PoolSensor, WeatherService};
use crate::store::Store;

/// Pool pump switch (smart relay)
#[async_trait]
pub trait PoolSwitchDevice: Send + Sync {
    async fn read_state(&self) -> Result<PoolSwitchState, AdapterError>;
    async fn switch_on(&self) -> Result<(), AdapterError>;
    async fn switch_off(&self) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSwitchState {
    pub on: bool,
    pub online: bool,
}

pub struct SimulatedPoolSwitch {
    state: RwLock<PoolSwitchState>,
}

impl SimulatedPoolSwitch {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PoolSwitchState {
                on: false,
                online: true,
            }),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.write().unwrap().online = online;
    }
}

impl Default for SimulatedPoolSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolSwitchDevice for SimulatedPoolSwitch {
    async fn read_state(&self) -> Result<PoolSwitchState, AdapterError> {
        let state = *self.state.read().unwrap();
        if !state.online {
            return Err(AdapterError::transport("pool switch offline"));
        }
        Ok(state)
    }

    async fn switch_on(&self) -> Result<(), AdapterError> {
        let mut st = self.state.write().unwrap();
        if !st.online {
            return Err(AdapterError::transport("pool switch offline"));
        }
        st.on = true;
        Ok(())
    }

    async fn switch_off(&self) -> Result<(), AdapterError> {
        let mut st = self.state.write().unwrap();
        if !st.online {
            return Err(AdapterError::transport("pool switch offline"));
        }
        st.on = false;
        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Pool filtration task.
///
/// Warm water needs more daily filtration; the required run time follows the
/// water temperature through the configured curve. Cumulative on-time is
/// tracked per day in the store, and priority climbs as the remaining
/// requirement closes in on the remaining daytime. Observed pump power
/// doubles as a health and clean-filter diagnostic.
pub struct PoolPumpTask {
    id: String,
    keys: Vec<String>,
    device: Arc<dyn PoolSwitchDevice>,
    pool: Arc<dyn PoolSensor>,
    weather: Arc<dyn WeatherService>,
    planner: Arc<DeadlinePlanner>,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    cfg: PoolPumpConfig,
    priority: Mutex<Priority>,
    remaining_runtime: Mutex<Duration>,
    target_time: Mutex<Option<DateTime<FixedOffset>>>,
    started_at: Mutex<Option<DateTime<FixedOffset>>>,
    last_update: Mutex<DateTime<FixedOffset>>,
    cycle_date: Mutex<Option<NaiveDate>>,
    powers: Mutex<Vec<f64>>,
    healthy: AtomicBool,
    filter_clean: AtomicBool,
}

impl PoolPumpTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<dyn PoolSwitchDevice>,
        pool: Arc<dyn PoolSensor>,
        weather: Arc<dyn WeatherService>,
        planner: Arc<DeadlinePlanner>,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        cfg: PoolPumpConfig,
        initial_priority: Priority,
    ) -> Self {
        let now = clock.now();
        Self {
            id: "pool_pump".to_string(),
            keys: vec![cfg.power_key.clone()],
            device,
            pool,
            weather,
            planner,
            store,
            clock,
            cfg,
            priority: Mutex::new(initial_priority),
            remaining_runtime: Mutex::new(Duration::zero()),
            target_time: Mutex::new(None),
            started_at: Mutex::new(None),
            last_update: Mutex::new(now),
            cycle_date: Mutex::new(None),
            powers: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            filter_clean: AtomicBool::new(true),
        }
    }

    fn min_run_time(&self) -> Duration {
        Duration::seconds(self.cfg.min_run_time_secs as i64)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn filter_is_clean(&self) -> bool {
        self.filter_clean.load(Ordering::Relaxed)
    }

    fn runtime_counter_key(&self, date: NaiveDate) -> String {
        format!("pool_runtime_minutes.{date}")
    }

    fn ran_today(&self) -> Duration {
        let key = self.runtime_counter_key(self.clock.now().date_naive());
        Duration::minutes(self.store.get::<i64>(&key).unwrap_or(0))
    }

    fn record_ran_today(&self, extra: Duration) {
        let key = self.runtime_counter_key(self.clock.now().date_naive());
        let total = self.store.get::<i64>(&key).unwrap_or(0) + extra.num_minutes();
        if let Err(err) = self.store.put(&key, &total) {
            warn!(error = %err, "could not persist the pool run-time counter");
        }
    }

    /// Daily required run time for the given water temperature
    fn required_runtime(&self, water_temp_f: f64) -> Duration {
        let [[t_lo, m_lo], [t_hi, m_hi]] = self.cfg.runtime_curve;
        let minutes = if water_temp_f <= t_lo {
            m_lo
        } else if water_temp_f >= t_hi {
            m_hi
        } else {
            m_lo + (m_hi - m_lo) * (water_temp_f - t_lo) / (t_hi - t_lo)
        };
        Duration::minutes(minutes.round() as i64)
    }

    /// Compute today's quota and target time; once per calendar day
    async fn configure_cycle(&self) -> Result<(), AdapterError> {
        let today = self.clock.now().date_naive();
        if *self.cycle_date.lock().unwrap() == Some(today) {
            return Ok(());
        }
        let water_temp = match self.pool.water_temperature().await {
            Ok(temp) => temp,
            // Cold pool sensor: the minimum outdoor forecast bounds the
            // water temperature well enough for the quota
            Err(_) => self.weather.minimum_temperature(24).await?,
        };
        let target = self.planner.latest_power_time(self.nominal_power()).await;
        let mut remaining = self.required_runtime(water_temp) - self.ran_today();
        if remaining < Duration::zero() {
            remaining = Duration::zero();
        }
        *self.remaining_runtime.lock().unwrap() = remaining;
        *self.target_time.lock().unwrap() = target;
        *self.cycle_date.lock().unwrap() = Some(today);
        debug!(
            water_temp,
            remaining_minutes = remaining.num_minutes(),
            target_time = ?target,
            "pool cycle configured"
        );
        Ok(())
    }

    async fn update_remaining_runtime(&self) -> Result<(), AdapterError> {
        let now = self.clock.now();
        let running = self.is_running().await?;
        let mut last_update = self.last_update.lock().unwrap();
        if running {
            let started = {
                let mut started_at = self.started_at.lock().unwrap();
                *started_at.get_or_insert(now)
            };
            let since = (*last_update).max(started);
            let elapsed = now - since;
            if elapsed > Duration::zero() {
                let mut remaining = self.remaining_runtime.lock().unwrap();
                *remaining = (*remaining - elapsed).max(Duration::zero());
                self.record_ran_today(elapsed);
            }
        }
        *last_update = now;
        Ok(())
    }

    async fn has_been_running_for(&self) -> Result<Duration, AdapterError> {
        if !self.is_running().await? {
            return Ok(Duration::zero());
        }
        let now = self.clock.now();
        let mut started_at = self.started_at.lock().unwrap();
        let started = *started_at.get_or_insert(now);
        Ok(now - started)
    }

    pub fn remaining_runtime(&self) -> Duration {
        *self.remaining_runtime.lock().unwrap()
    }
}

#[async_trait]
impl Task for PoolPumpTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        *self.priority.lock().unwrap()
    }

    fn nominal_power(&self) -> f64 {
        // Observed draw beats the configured figure once the pump has run
        let powers = self.powers.lock().unwrap();
        powers
            .iter()
            .copied()
            .fold(None::<f64>, |max, p| Some(max.map_or(p, |m| m.max(p))))
            .unwrap_or(self.cfg.power_kw)
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }

    async fn adjust_priority(&self) -> Result<(), AdapterError> {
        self.configure_cycle().await?;
        self.update_remaining_runtime().await?;

        let now = self.clock.now();
        let remaining = self.remaining_runtime();
        let target = *self.target_time.lock().unwrap();
        let priority = match target {
            _ if remaining <= Duration::zero() => Priority::Low,
            None => Priority::Low,
            Some(target) => {
                let lead = target - now;
                if lead > remaining + remaining / 2 {
                    Priority::Low
                } else if lead > remaining {
                    Priority::Medium
                } else {
                    Priority::High
                }
            }
        };
        *self.priority.lock().unwrap() = priority;
        Ok(())
    }

    async fn is_runnable(&self) -> Result<bool, AdapterError> {
        if self.remaining_runtime() <= Duration::zero() {
            return Ok(false);
        }
        if self.target_time.lock().unwrap().is_none() {
            return Ok(false);
        }
        Ok(self.device.read_state().await?.online)
    }

    async fn is_running(&self) -> Result<bool, AdapterError> {
        Ok(self.device.read_state().await?.on)
    }

    async fn is_stoppable(&self) -> Result<bool, AdapterError> {
        if self.has_been_running_for().await? <= self.min_run_time() {
            return Ok(false);
        }
        Ok(self.device.read_state().await?.online)
    }

    async fn meet_running_criteria(&self, ratio: f64, power: f64) -> Result<bool, AdapterError> {
        if self.has_been_running_for().await? > Duration::minutes(2) {
            // The pump either moves water or it does not; near-zero power
            // after spin-up means the switch lies or the pump is broken
            self.healthy.store(power > 0.2, Ordering::Relaxed);
            let mut powers = self.powers.lock().unwrap();
            powers.push(power);
            self.filter_clean.store(
                mean(&powers) > self.cfg.clean_filter_threshold,
                Ordering::Relaxed,
            );
        }
        Ok(self.is_runnable().await? && ratio >= 0.9)
    }

    async fn start(&self) -> Result<(), AdapterError> {
        debug!("starting the pool pump");
        self.device.switch_on().await?;
        *self.started_at.lock().unwrap() = Some(self.clock.now());
        self.powers.lock().unwrap().clear();
        // A start is also a recovery attempt
        self.healthy.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        debug!("stopping the pool pump");
        self.device.switch_off().await?;
        *self.started_at.lock().unwrap() = None;
        Ok(())
    }

    async fn desc(&self) -> String {
        let mut desc = format!(
            "PoolPump({}, {}min)",
            self.priority(),
            self.remaining_runtime().num_minutes()
        );
        if !self.filter_is_clean() {
            desc.push_str(" [dirty filter]");
        }
        desc
    }
}
