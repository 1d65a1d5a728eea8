use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::config::HvacConfig;
use crate::domain::{AdapterError, Clock, Priority, Task};
use crate::planner::{DeadlinePlan, DeadlinePlanner};
use crate::sensor::WeatherService;
use crate::thermal::{HomeModel, HvacModel};

/// Thermostat control surface (hold-based thermostats)
#[async_trait]
pub trait ThermostatDevice: Send + Sync {
    async fn read_state(&self) -> Result<ThermostatState, AdapterError>;
    /// Hold the given set-points for `hours`
    async fn set_hold(&self, heat_temp: f64, cool_temp: f64, hours: i64)
        -> Result<(), AdapterError>;
    /// Drop the hold and resume the device schedule
    async fn resume_program(&self) -> Result<(), AdapterError>;
}

/// Thermostat operating mode; the sign gives the helpful direction of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HvacMode {
    Off,
    Cool,
    Heat,
    Auto,
}

impl HvacMode {
    /// +1 heats, -1 cools, 0 undetermined
    pub fn sign(self) -> f64 {
        match self {
            HvacMode::Heat => 1.0,
            HvacMode::Cool => -1.0,
            HvacMode::Auto | HvacMode::Off => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermostatState {
    /// Indoor temperature, °F
    pub indoor_temp: f64,
    pub mode: HvacMode,
    /// Compressor or air handler actually drawing
    pub equipment_running: bool,
    /// A hold we (or the user) placed is active
    pub on_hold: bool,
}

/// Simulated hold-based thermostat
pub struct SimulatedThermostat {
    state: RwLock<ThermostatState>,
}

impl SimulatedThermostat {
    pub fn new(indoor_temp: f64, mode: HvacMode) -> Self {
        Self {
            state: RwLock::new(ThermostatState {
                indoor_temp,
                mode,
                equipment_running: false,
                on_hold: false,
            }),
        }
    }

    pub fn set_indoor_temp(&self, temp: f64) {
        self.state.write().unwrap().indoor_temp = temp;
    }
}

#[async_trait]
impl ThermostatDevice for SimulatedThermostat {
    async fn read_state(&self) -> Result<ThermostatState, AdapterError> {
        Ok(self.state.read().unwrap().clone())
    }

    async fn set_hold(
        &self,
        _heat_temp: f64,
        _cool_temp: f64,
        _hours: i64,
    ) -> Result<(), AdapterError> {
        let mut st = self.state.write().unwrap();
        st.on_hold = true;
        st.equipment_running = true;
        Ok(())
    }

    async fn resume_program(&self) -> Result<(), AdapterError> {
        let mut st = self.state.write().unwrap();
        st.on_hold = false;
        st.equipment_running = false;
        Ok(())
    }
}

/// HVAC task driven by the deadline planner.
///
/// Each tick recomputes the last instant the PV array can still carry the
/// unit, the temperature the home must reach by then so passive drift lands
/// on the comfort goal, and the passive curve between now and that target.
/// Power need follows the outdoor temperature through the fitted model.
pub struct HvacTask {
    id: String,
    keys: Vec<String>,
    device: Arc<dyn ThermostatDevice>,
    planner: Arc<DeadlinePlanner>,
    weather: Arc<dyn WeatherService>,
    hvac_model: Arc<HvacModel>,
    home_model: Arc<HomeModel>,
    clock: Arc<dyn Clock>,
    cfg: HvacConfig,
    priority: Mutex<Priority>,
    nominal_power: Mutex<f64>,
    max_available_power: Mutex<f64>,
    outdoor_temp: Mutex<f64>,
    plan: Mutex<Option<DeadlinePlan>>,
    started_at: Mutex<Option<DateTime<FixedOffset>>>,
    stopped_at: Mutex<Option<DateTime<FixedOffset>>>,
}

impl HvacTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<dyn ThermostatDevice>,
        planner: Arc<DeadlinePlanner>,
        weather: Arc<dyn WeatherService>,
        hvac_model: Arc<HvacModel>,
        home_model: Arc<HomeModel>,
        clock: Arc<dyn Clock>,
        cfg: HvacConfig,
        initial_priority: Priority,
    ) -> Self {
        let nominal = hvac_model.power(75.0);
        Self {
            id: "hvac".to_string(),
            keys: cfg.power_keys.clone(),
            device,
            planner,
            weather,
            hvac_model,
            home_model,
            clock,
            cfg,
            priority: Mutex::new(initial_priority),
            nominal_power: Mutex::new(nominal),
            max_available_power: Mutex::new(0.0),
            outdoor_temp: Mutex::new(75.0),
            plan: Mutex::new(None),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    fn min_run_time(&self) -> Duration {
        Duration::seconds(self.cfg.min_run_time_secs as i64)
    }

    fn plan(&self) -> Option<DeadlinePlan> {
        self.plan.lock().unwrap().clone()
    }

    /// Signed distance from the target; positive means too warm
    async fn deviation(&self) -> Result<f64, AdapterError> {
        let state = self.device.read_state().await?;
        let target = self
            .plan()
            .map(|p| p.target_value)
            .unwrap_or(self.cfg.goal_temperature);
        Ok(state.indoor_temp - target)
    }

    /// Mode that would move the home toward the target, if any
    async fn helpful_mode(&self) -> Result<Option<HvacMode>, AdapterError> {
        let state = self.device.read_state().await?;
        let deviation = self.deviation().await?;
        if deviation == 0.0 {
            return Ok(None);
        }
        for mode in [HvacMode::Heat, HvacMode::Cool] {
            if state.mode != HvacMode::Auto && state.mode != mode {
                continue;
            }
            if deviation * mode.sign() < 0.0 {
                return Ok(Some(mode));
            }
        }
        Ok(None)
    }

    /// Run time needed to close the deviation at the current outdoor
    /// temperature
    async fn estimate_runtime(&self) -> Result<Duration, AdapterError> {
        if self.helpful_mode().await?.is_none() {
            return Ok(Duration::zero());
        }
        let deviation = self.deviation().await?.abs();
        let outdoor = *self.outdoor_temp.lock().unwrap();
        let minutes = self.hvac_model.minutes_per_degree(outdoor) * deviation;
        Ok(Duration::minutes(minutes as i64))
    }

    async fn refresh_plan(&self) -> Result<(), AdapterError> {
        let now = self.clock.now();
        if let Ok(conditions) = self.weather.current().await {
            *self.outdoor_temp.lock().unwrap() = conditions.temperature;
        }
        let outdoor = *self.outdoor_temp.lock().unwrap();
        *self.nominal_power.lock().unwrap() = self.hvac_model.power(outdoor);

        let fresh = self
            .plan()
            .map_or(false, |p| now <= p.target_time);
        if fresh {
            return Ok(());
        }

        let target_time = match self.planner.hvac_target_time(&self.hvac_model).await {
            Some(t) => t,
            // Keep a stale plan so the deadline urgency survives past the
            // target; a day that never had a window never creates one.
            None => return Ok(()),
        };
        let goal_time = goal_datetime(target_time, self.cfg.goal_time);
        let target_value = self
            .planner
            .backward_target_value(
                &self.home_model,
                target_time,
                goal_time,
                self.cfg.goal_temperature,
                self.cfg.comfort_zone,
            )
            .await;
        let indoor = self.device.read_state().await?.indoor_temp;
        let plan = self
            .planner
            .plan(target_time, target_value, indoor, self.cfg.curve_deadband);
        debug!(
            target_time = %plan.target_time,
            target_value = plan.target_value,
            "HVAC plan updated"
        );
        *self.plan.lock().unwrap() = Some(plan);
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
}

/// Goal instant on the target's calendar day
fn goal_datetime(target_time: DateTime<FixedOffset>, goal: NaiveTime) -> DateTime<FixedOffset> {
    target_time
        .date_naive()
        .and_time(goal)
        .and_local_timezone(*target_time.offset())
        .unwrap()
}

#[async_trait]
impl Task for HvacTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        *self.priority.lock().unwrap()
    }

    fn nominal_power(&self) -> f64 {
        *self.nominal_power.lock().unwrap()
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }

    async fn adjust_priority(&self) -> Result<(), AdapterError> {
        self.refresh_plan().await?;
        *self.max_available_power.lock().unwrap() = self.planner.max_available_power().await;

        let now = self.clock.now();
        let run_time = self.estimate_runtime().await?;
        let plan = self.plan();

        let priority = match plan {
            _ if run_time < self.min_run_time() => Priority::Background,
            None => Priority::Background,
            Some(plan) if now > plan.target_time => Priority::Urgent,
            Some(plan) => {
                // How many runs of this length still fit before the target
                let count = (plan.target_time - now).num_seconds() as f64
                    / run_time.num_seconds().max(1) as f64;
                if count < 0.0 || count > Priority::LEVELS as f64 {
                    Priority::Background
                } else {
                    Priority::from_index(
                        Priority::LEVELS.saturating_sub(1 + count.floor() as usize),
                    )
                }
            }
        };
        *self.priority.lock().unwrap() = priority;
        Ok(())
    }

    async fn is_runnable(&self) -> Result<bool, AdapterError> {
        let state = self.device.read_state().await?;
        if state.mode == HvacMode::Off || self.plan().is_none() {
            return Ok(false);
        }
        let now = self.clock.now();
        let paused = self
            .stopped_at
            .lock()
            .unwrap()
            .map_or(false, |at| now < at + Duration::seconds(self.cfg.min_pause_secs as i64));
        if paused {
            return Ok(false);
        }
        Ok(self.estimate_runtime().await? >= self.min_run_time())
    }

    async fn is_running(&self) -> Result<bool, AdapterError> {
        let state = self.device.read_state().await?;
        Ok(state.equipment_running || state.on_hold)
    }

    async fn is_stoppable(&self) -> Result<bool, AdapterError> {
        if self.has_been_running_for().await? <= self.min_run_time() {
            return Ok(false);
        }
        Ok(self.device.read_state().await?.on_hold)
    }

    async fn meet_running_criteria(&self, ratio: f64, power: f64) -> Result<bool, AdapterError> {
        if self.priority() == Priority::Urgent {
            return Ok(true);
        }
        let max_available = *self.max_available_power.lock().unwrap();
        let nominal = self.nominal_power();
        if self.is_running().await? {
            let mode = self.device.read_state().await?.mode;
            if self.deviation().await? * mode.sign() > 0.0 {
                debug!("target temperature reached");
                return Ok(false);
            }
            if self.has_been_running_for().await? > self.min_run_time() {
                let wanted = (0.9 * max_available / power.max(1e-6)).min(1.0);
                return Ok(power > 0.0 && ratio >= wanted && power > nominal / 3.0);
            }
            return Ok(true);
        }
        // Only start when the home is behind the passive curve
        let state = self.device.read_state().await?;
        let behind = match (self.plan(), self.helpful_mode().await?) {
            (Some(plan), Some(HvacMode::Cool)) => {
                plan.curve.is_above(self.clock.now(), state.indoor_temp)
            }
            (Some(plan), Some(HvacMode::Heat)) => {
                plan.curve.is_below(self.clock.now(), state.indoor_temp)
            }
            _ => false,
        };
        if !behind {
            return Ok(false);
        }
        Ok(ratio >= (0.95 * max_available / nominal).min(1.0))
    }

    async fn start(&self) -> Result<(), AdapterError> {
        let mode = match self.helpful_mode().await? {
            Some(mode) => mode,
            None => return Ok(()),
        };
        let duration = self.estimate_runtime().await?;
        let target = self
            .plan()
            .map(|p| p.target_value)
            .unwrap_or(self.cfg.goal_temperature)
            + mode.sign() * self.cfg.temperature_offset;
        let hours = (duration.num_minutes() as f64 / 60.0).ceil().max(1.0) as i64;
        debug!(minutes = duration.num_minutes(), target, "starting the HVAC");
        self.device
            .set_hold(target, target + mode.sign() * 2.0, hours)
            .await?;
        *self.started_at.lock().unwrap() = Some(self.clock.now());
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.device.resume_program().await?;
        *self.started_at.lock().unwrap() = None;
        *self.stopped_at.lock().unwrap() = Some(self.clock.now());
        Ok(())
    }

    async fn desc(&self) -> String {
        match self.device.read_state().await {
            Ok(state) => format!("Hvac({}, {:.1}F)", self.priority(), state.indoor_temp),
            Err(_) => format!("Hvac({})", self.priority()),
        }
    }
}
