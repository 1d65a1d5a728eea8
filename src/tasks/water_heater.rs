use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::config::WaterHeaterConfig;
use crate::domain::{AdapterError, Clock, Priority, Task};
use crate::planner::DeadlinePlanner;

/// Water heater control surface (away/boost style controllers)
#[async_trait]
pub trait WaterHeaterDevice: Send + Sync {
    async fn read_state(&self) -> Result<WaterHeaterState, AdapterError>;
    /// Force heating for the given duration
    async fn boost(&self, minutes: i64) -> Result<(), AdapterError>;
    /// Suppress heating for the given duration
    async fn away(&self, minutes: i64) -> Result<(), AdapterError>;
    /// Fall back to the device's own schedule
    async fn timer(&self) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaterHeaterMode {
    Timer,
    Boost,
    Away,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterHeaterState {
    /// Tank water temperature, °F
    pub temperature: f64,
    /// Available hot water fraction, 0..1
    pub tank_level: f64,
    pub mode: WaterHeaterMode,
}

/// Simulated away/boost water heater
pub struct SimulatedWaterHeater {
    state: RwLock<WaterHeaterState>,
}

impl SimulatedWaterHeater {
    pub fn new(temperature: f64, tank_level: f64) -> Self {
        Self {
            state: RwLock::new(WaterHeaterState {
                temperature,
                tank_level,
                mode: WaterHeaterMode::Timer,
            }),
        }
    }

    pub fn set_water(&self, temperature: f64, tank_level: f64) {
        let mut st = self.state.write().unwrap();
        st.temperature = temperature;
        st.tank_level = tank_level.clamp(0.0, 1.0);
    }
}

#[async_trait]
impl WaterHeaterDevice for SimulatedWaterHeater {
    async fn read_state(&self) -> Result<WaterHeaterState, AdapterError> {
        Ok(self.state.read().unwrap().clone())
    }

    async fn boost(&self, _minutes: i64) -> Result<(), AdapterError> {
        self.state.write().unwrap().mode = WaterHeaterMode::Boost;
        Ok(())
    }

    async fn away(&self, _minutes: i64) -> Result<(), AdapterError> {
        self.state.write().unwrap().mode = WaterHeaterMode::Away;
        Ok(())
    }

    async fn timer(&self) -> Result<(), AdapterError> {
        self.state.write().unwrap().mode = WaterHeaterMode::Timer;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ObservedWater {
    temperature: Option<f64>,
    tank_level: Option<f64>,
}

impl ObservedWater {
    /// The tank sensors sit outside the tank and overreport after short
    /// runs. Only accept improving readings when forced; degrading readings
    /// are always believed.
    fn update(&mut self, temperature: f64, tank_level: f64, force: bool) {
        let degraded = self.temperature.map_or(true, |t| temperature < t)
            || self.tank_level.map_or(true, |l| tank_level < l);
        if force || degraded {
            self.temperature = Some(temperature);
            self.tank_level = Some(tank_level);
        }
    }
}

/// Water heating task.
///
/// Priority climbs as the tank drains or cools. The tank state is partially
/// software-derived on the device side, so a heater that stops drawing power
/// shortly after a start is taken as full and the task benches itself for a
/// cool-down.
pub struct WaterHeaterTask {
    id: String,
    keys: Vec<String>,
    device: Arc<dyn WaterHeaterDevice>,
    planner: Arc<DeadlinePlanner>,
    clock: Arc<dyn Clock>,
    cfg: WaterHeaterConfig,
    priority: Mutex<Priority>,
    observed: Mutex<ObservedWater>,
    target_time: Mutex<Option<DateTime<FixedOffset>>>,
    started_at: Mutex<Option<DateTime<FixedOffset>>>,
    not_runnable_till: Mutex<Option<DateTime<FixedOffset>>>,
    has_reached_target: Mutex<bool>,
}

impl WaterHeaterTask {
    pub fn new(
        device: Arc<dyn WaterHeaterDevice>,
        planner: Arc<DeadlinePlanner>,
        clock: Arc<dyn Clock>,
        cfg: WaterHeaterConfig,
        initial_priority: Priority,
    ) -> Self {
        Self {
            id: "water_heater".to_string(),
            keys: vec![cfg.power_key.clone()],
            device,
            planner,
            clock,
            cfg,
            priority: Mutex::new(initial_priority),
            observed: Mutex::new(ObservedWater::default()),
            target_time: Mutex::new(None),
            started_at: Mutex::new(None),
            not_runnable_till: Mutex::new(None),
            has_reached_target: Mutex::new(false),
        }
    }

    fn min_run_time(&self) -> Duration {
        Duration::seconds(self.cfg.min_run_time_secs as i64)
    }

    async fn update_state(&self) -> Result<(), AdapterError> {
        let state = self.device.read_state().await?;
        let now = self.clock.now();
        let mut observed = self.observed.lock().unwrap();
        let mut bench = self.not_runnable_till.lock().unwrap();
        let force = bench.map_or(false, |till| now < till);
        // A draining tank reopens the bench; hot water is being used
        if let Some(level) = observed.tank_level {
            if level > state.tank_level {
                *bench = None;
            }
        }
        observed.update(state.temperature, state.tank_level, force);
        Ok(())
    }

    fn observed(&self) -> (f64, f64) {
        let observed = self.observed.lock().unwrap();
        (
            observed.temperature.unwrap_or(self.cfg.desired_temperature),
            observed.tank_level.unwrap_or(1.0),
        )
    }

    /// Minutes to bring the whole tank to the set-point, assuming refill
    /// water at 60 °F
    fn estimate_run_time(&self) -> Duration {
        let (temperature, level) = self.observed();
        let mix = 60.0 * (1.0 - level) + temperature * level;
        let deviation = (self.cfg.desired_temperature - mix).max(0.0);
        Duration::minutes((deviation * self.cfg.minutes_per_degree) as i64)
    }

    async fn has_been_running_for(&self) -> Result<Duration, AdapterError> {
        if self.device.read_state().await?.mode != WaterHeaterMode::Boost {
            return Ok(Duration::zero());
        }
        let now = self.clock.now();
        let mut started_at = self.started_at.lock().unwrap();
        // Started outside our control (device app, schedule)
        let started = *started_at.get_or_insert(now);
        Ok(now - started)
    }

    async fn refresh_target_time(&self) {
        let now = self.clock.now();
        let stale = self
            .target_time
            .lock()
            .unwrap()
            .map_or(true, |t| now > t);
        if !stale {
            return;
        }
        if let Some(end) = self.planner.latest_power_time(self.cfg.power_kw).await {
            debug!(target_time = %end, "water heater target time updated");
            *self.target_time.lock().unwrap() = Some(end);
        }
    }

    fn deadline_is_close(&self) -> bool {
        let now = self.clock.now();
        match *self.target_time.lock().unwrap() {
            Some(target) => target - now < self.estimate_run_time(),
            None => true,
        }
    }
}

#[async_trait]
impl Task for WaterHeaterTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        *self.priority.lock().unwrap()
    }

    fn nominal_power(&self) -> f64 {
        self.cfg.power_kw
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }

    async fn adjust_priority(&self) -> Result<(), AdapterError> {
        self.update_state().await?;
        self.refresh_target_time().await;
        let (temperature, level) = self.observed();

        // (tank fraction, °F) floors per level, most urgent first
        let ladder = [
            (Priority::Urgent, 0.5, 110.0),
            (Priority::High, 0.7, 120.0),
            (Priority::Medium, 0.9, self.cfg.desired_temperature),
            (Priority::Low, 1.0, self.cfg.desired_temperature),
        ];
        for (priority, level_floor, temp_floor) in ladder {
            if level >= level_floor && temperature >= temp_floor {
                continue;
            }
            let mut new_priority = priority;
            // Running out of time beats the nominal ladder level
            if new_priority < Priority::Urgent && self.deadline_is_close() {
                debug!("close to the target time, raising the priority");
                new_priority = new_priority.raised();
            }
            *self.priority.lock().unwrap() = new_priority;
            *self.has_reached_target.lock().unwrap() = false;
            return Ok(());
        }
        *self.has_reached_target.lock().unwrap() = true;
        *self.priority.lock().unwrap() = Priority::Background;
        Ok(())
    }

    async fn is_runnable(&self) -> Result<bool, AdapterError> {
        let now = self.clock.now();
        let benched = self
            .not_runnable_till
            .lock()
            .unwrap()
            .map_or(false, |till| now < till);
        Ok(!benched && !*self.has_reached_target.lock().unwrap())
    }

    async fn is_running(&self) -> Result<bool, AdapterError> {
        Ok(self.device.read_state().await?.mode == WaterHeaterMode::Boost)
    }

    async fn is_stoppable(&self) -> Result<bool, AdapterError> {
        if !self.is_runnable().await? {
            return Ok(true);
        }
        Ok(self.has_been_running_for().await? > self.min_run_time())
    }

    async fn meet_running_criteria(&self, ratio: f64, power: f64) -> Result<bool, AdapterError> {
        let duration = self.has_been_running_for().await?;
        if duration > Duration::zero() {
            // Full-tank detection: a heater that keeps drawing nothing after
            // the grace period is done, whatever the sensors claim
            let (_, level) = self.observed();
            let (grace, power_floor) = if level >= 1.0 || duration >= Duration::minutes(4) {
                (Duration::seconds(30), self.cfg.power_kw / 2.0)
            } else {
                (Duration::seconds(90), 0.0)
            };
            if duration > grace && power <= power_floor {
                let mut delay = Duration::seconds(self.cfg.no_power_delay_secs as i64);
                if duration > Duration::minutes(3) {
                    delay = delay * 4;
                }
                debug!(delay_minutes = delay.num_minutes(), "tank looks full, benching");
                *self.not_runnable_till.lock().unwrap() = Some(self.clock.now() + delay);
                return Ok(false);
            }
        }
        // Deadline override: run on any ratio rather than miss the day
        if self.priority() == Priority::Urgent && self.deadline_is_close() {
            return Ok(true);
        }
        Ok(ratio >= 1.0)
    }

    async fn start(&self) -> Result<(), AdapterError> {
        let state = self.device.read_state().await?;
        if state.mode == WaterHeaterMode::Boost {
            return Ok(());
        }
        if state.mode == WaterHeaterMode::Away {
            self.device.timer().await?;
        }
        let duration = self.estimate_run_time().max(self.min_run_time());
        debug!(minutes = duration.num_minutes(), "starting the water heater");
        self.device.boost(duration.num_minutes()).await?;
        *self.started_at.lock().unwrap() = Some(self.clock.now());
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        if self.device.read_state().await?.mode == WaterHeaterMode::Boost {
            self.device.timer().await?;
        }
        *self.started_at.lock().unwrap() = None;
        Ok(())
    }

    async fn desc(&self) -> String {
        let (temperature, level) = self.observed();
        format!(
            "WaterHeater({}, {:.0}%, {:.1}F)",
            self.priority(),
            level * 100.0,
            temperature
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PvConfig;
    use crate::domain::ManualClock;
    use crate::pv::{PvArray, PvPredictor};
    use crate::sensor::{StaticWeather, WeatherService};
    use chrono::TimeZone;

    fn phoenix(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 21, hour, minute, 0)
            .unwrap()
    }

    fn cfg() -> WaterHeaterConfig {
        WaterHeaterConfig {
            power_key: "water_heater".to_string(),
            power_kw: 4.65,
            minutes_per_degree: 2.0,
            desired_temperature: 125.0,
            min_run_time_secs: 600,
            no_power_delay_secs: 1800,
        }
    }

    fn fixture(
        now: DateTime<FixedOffset>,
        temperature: f64,
        level: f64,
    ) -> (WaterHeaterTask, Arc<SimulatedWaterHeater>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let weather: Arc<dyn WeatherService> = Arc::new(StaticWeather::new(95.0, 5.0));
        let pv_cfg = PvConfig {
            latitude: 33.45,
            longitude: -112.07,
            tilt: 30.0,
            azimuth: 180.0,
            modules_per_string: 8,
            strings: 3,
            module_power_w: 335.0,
            temperature_coefficient: -0.0025,
            inverter_peak_kw: 6.06,
            installation_date: None,
            first_year_degradation: 2.0,
            other_year_degradation: 0.33,
            base_power_kw: 0.4,
            forecast_epsilon: 2.0,
        };
        let pv = Arc::new(PvPredictor::new(
            PvArray::new(&pv_cfg),
            weather.clone(),
            clock.clone(),
            2.0,
        ));
        let planner = Arc::new(DeadlinePlanner::new(pv, weather, clock.clone()));
        let device = Arc::new(SimulatedWaterHeater::new(temperature, level));
        let task = WaterHeaterTask::new(device.clone(), planner, clock.clone(), cfg(), Priority::Low);
        (task, device, clock)
    }

    #[tokio::test]
    async fn test_priority_ladder() {
        let (task, _, _) = fixture(phoenix(10, 0), 100.0, 0.4);
        task.adjust_priority().await.unwrap();
        assert_eq!(task.priority(), Priority::Urgent);

        let (task, _, _) = fixture(phoenix(10, 0), 122.0, 0.8);
        task.adjust_priority().await.unwrap();
        assert_eq!(task.priority(), Priority::Medium);

        let (task, _, _) = fixture(phoenix(10, 0), 126.0, 1.0);
        task.adjust_priority().await.unwrap();
        assert_eq!(task.priority(), Priority::Background);
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn test_degrading_readings_are_always_believed() {
        let (task, device, _) = fixture(phoenix(10, 0), 124.0, 1.0);
        task.adjust_priority().await.unwrap();
        device.set_water(108.0, 0.45);
        task.adjust_priority().await.unwrap();
        assert_eq!(task.priority(), Priority::Urgent);
    }

    #[tokio::test]
    async fn test_estimate_run_time_scales_with_deficit() {
        let (task, _, _) = fixture(phoenix(10, 0), 110.0, 0.5);
        // Mix: 60 * 0.5 + 110 * 0.5 = 85; deficit 40 °F at 2 min/°F
        assert_eq!(task.estimate_run_time(), Duration::minutes(80));
    }

    #[tokio::test]
    async fn test_full_tank_heuristic_benches_the_task() {
        let (task, _, clock) = fixture(phoenix(10, 0), 120.0, 1.0);
        task.adjust_priority().await.unwrap();
        task.start().await.unwrap();
        clock.advance(Duration::seconds(45));

        // Full tank claimed, no power drawn after the 30 s grace
        assert!(!task.meet_running_criteria(1.5, 0.0).await.unwrap());
        assert!(!task.is_runnable().await.unwrap());

        // The bench expires
        clock.advance(Duration::seconds(1801));
        assert!(task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn test_drawing_power_keeps_criteria_alive() {
        let (task, _, clock) = fixture(phoenix(10, 0), 115.0, 0.8);
        task.adjust_priority().await.unwrap();
        task.start().await.unwrap();
        clock.advance(Duration::minutes(2));
        assert!(task.meet_running_criteria(1.2, 4.6).await.unwrap());
    }

    #[tokio::test]
    async fn test_deadline_override_accepts_any_ratio() {
        // Urgent water state late in the day: target window is nearly gone
        let (task, _, _) = fixture(phoenix(16, 0), 100.0, 0.4);
        task.adjust_priority().await.unwrap();
        assert_eq!(task.priority(), Priority::Urgent);
        assert!(task.meet_running_criteria(0.2, 0.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_requires_full_coverage_without_deadline_pressure() {
        let (task, _, _) = fixture(phoenix(9, 0), 121.0, 0.85);
        task.adjust_priority().await.unwrap();
        assert_ne!(task.priority(), Priority::Urgent);
        assert!(!task.meet_running_criteria(0.9, 0.0).await.unwrap());
        assert!(task.meet_running_criteria(1.0, 0.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (task, device, _) = fixture(phoenix(10, 0), 115.0, 0.8);
        task.start().await.unwrap();
        task.stop().await.unwrap();
        task.stop().await.unwrap();
        assert_eq!(
            device.read_state().await.unwrap().mode,
            WaterHeaterMode::Timer
        );
    }

    #[tokio::test]
    async fn test_min_run_time_blocks_stop() {
        let (task, _, clock) = fixture(phoenix(10, 0), 110.0, 0.5);
        task.adjust_priority().await.unwrap();
        task.start().await.unwrap();
        clock.advance(Duration::minutes(5));
        assert!(!task.is_stoppable().await.unwrap());
        clock.advance(Duration::minutes(6));
        assert!(task.is_stoppable().await.unwrap());
    }
}
