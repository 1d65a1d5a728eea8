//! End-to-end scheduling scenarios against simulated devices and a scripted
//! power meter.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use std::collections::HashMap;
use std::sync::Arc;

use solar_appliance_scheduler::config::{
    CarChargerConfig, PoolPumpConfig, PvConfig, SocPriorityTable, WaterHeaterConfig,
};
use solar_appliance_scheduler::domain::{
    AdapterError, Clock, ManualClock, PowerRecord, Priority, Task,
};
use solar_appliance_scheduler::planner::DeadlinePlanner;
use solar_appliance_scheduler::pv::{PvArray, PvPredictor};
use solar_appliance_scheduler::scheduler::{Scheduler, SchedulerSettings};
use solar_appliance_scheduler::sensor::{
    ScriptedPowerMeter, SimulatedCarSensor, SimulatedPoolSensor, StaticWeather, WeatherService,
};
use solar_appliance_scheduler::store::Store;
use solar_appliance_scheduler::tasks::{
    CarChargerTask, ChargerCapabilities, ChargerDevice, ChargerState, PoolPumpTask,
    PoolSwitchDevice, SimulatedCharger, SimulatedPoolSwitch, SimulatedWaterHeater,
    WaterHeaterDevice, WaterHeaterMode, WaterHeaterTask,
};
use solar_appliance_scheduler::window::Thresholds;

fn phoenix(hour: u32, minute: u32) -> DateTime<FixedOffset> {
    FixedOffset::west_opt(7 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 6, 21, hour, minute, 0)
        .unwrap()
}

fn pv_config() -> PvConfig {
    PvConfig {
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
    }
}

fn charger_config() -> CarChargerConfig {
    CarChargerConfig {
        power_key: "ev".to_string(),
        priority_table: SocPriorityTable {
            urgent_below: 40.0,
            high_below: 55.0,
            medium_below: 70.0,
            low_below: 101.0,
        },
        max_state_of_charge: 79.6,
        cycle_secs: 15,
    }
}

fn water_heater_config() -> WaterHeaterConfig {
    WaterHeaterConfig {
        power_key: "water_heater".to_string(),
        power_kw: 4.65,
        minutes_per_degree: 2.0,
        desired_temperature: 125.0,
        min_run_time_secs: 600,
        no_power_delay_secs: 1800,
    }
}

fn pool_config() -> PoolPumpConfig {
    PoolPumpConfig {
        power_key: "pool".to_string(),
        power_kw: 2.0,
        min_run_time_secs: 420,
        clean_filter_threshold: 1.55,
        runtime_curve: [[52.0, 60.0], [75.0, 300.0]],
    }
}

struct Rig {
    scheduler: Arc<Scheduler>,
    meter: Arc<ScriptedPowerMeter>,
    simulator: Arc<ScriptedPowerMeter>,
    clock: Arc<ManualClock>,
    planner: Arc<DeadlinePlanner>,
    store: Arc<Store>,
    _dir: tempfile::TempDir,
}

fn rig(now: DateTime<FixedOffset>, outdoor_f: f64) -> Rig {
    let clock = Arc::new(ManualClock::new(now));
    let weather: Arc<dyn WeatherService> = Arc::new(StaticWeather::new(outdoor_f, 5.0));
    let predictor = Arc::new(PvPredictor::new(
        PvArray::new(&pv_config()),
        weather.clone(),
        clock.clone(),
        2.0,
    ));
    let planner = Arc::new(DeadlinePlanner::new(
        predictor.clone(),
        weather,
        clock.clone(),
    ));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("storage.json")).unwrap());
    let meter = Arc::new(ScriptedPowerMeter::new());
    let simulator = Arc::new(ScriptedPowerMeter::new());
    let settings = SchedulerSettings {
        tick_interval: std::time::Duration::from_secs(60),
        window_size: 60,
        max_record_gap: Duration::minutes(3),
        call_timeout: std::time::Duration::from_secs(3),
        stale_limit: 3,
    };
    let scheduler = Arc::new(Scheduler::new(
        clock.clone(),
        meter.clone(),
        simulator.clone(),
        predictor,
        store.clone(),
        settings,
        Thresholds::new(HashMap::new(), 0.1),
    ));
    Rig {
        scheduler,
        meter,
        simulator,
        clock,
        planner,
        store,
        _dir: dir,
    }
}

fn record(at: DateTime<FixedOffset>, production: f64, consumption: f64) -> PowerRecord {
    PowerRecord::new(at)
        .with_channel("production", production)
        .with_channel("consumption", consumption)
}

/// Feed one record and run one tick, advancing the clock a minute after
async fn step(rig: &Rig, record: PowerRecord) {
    rig.meter.enqueue(record);
    rig.scheduler.tick().await;
    rig.clock.advance(Duration::minutes(1));
}

#[tokio::test]
async fn sunny_afternoon_starts_and_tunes_the_charger() {
    let rig = rig(phoenix(12, 0), 95.0);
    let device = Arc::new(SimulatedCharger::single_phase_240v());
    device.plug_in();
    let car = Arc::new(SimulatedCarSensor::new(50.0));
    let task = Arc::new(CarChargerTask::new(
        device.clone(),
        car,
        charger_config(),
        Priority::Low,
    ));
    rig.scheduler.register(task).unwrap();

    // 6 kW production against a 0.6 kW house load
    step(&rig, record(phoenix(12, 0), 6.0, 0.6)).await;

    let state = device.read_state().await.unwrap();
    assert!(state.charging, "charger should start on surplus");
    // 5.4 kW surplus at 240 V, clamped to whole amps
    assert_eq!(state.current_amps, 22.0);
}

#[tokio::test]
async fn urgent_charger_preempts_the_water_heater() {
    let rig = rig(phoenix(10, 0), 95.0);

    let heater_device = Arc::new(SimulatedWaterHeater::new(112.0, 0.6));
    heater_device.boost(60).await.unwrap();
    let heater = Arc::new(WaterHeaterTask::new(
        heater_device.clone(),
        rig.planner.clone(),
        rig.clock.clone(),
        water_heater_config(),
        Priority::Low,
    ));

    let charger_device = Arc::new(SimulatedCharger::single_phase_240v());
    let car = Arc::new(SimulatedCarSensor::new(10.0));
    let charger = Arc::new(CarChargerTask::new(
        charger_device.clone(),
        car,
        charger_config(),
        Priority::Low,
    ));

    rig.scheduler.register(heater).unwrap();
    rig.scheduler.register(charger).unwrap();

    // Production exactly covers the heater; it meets its own criteria and
    // would keep running. Establish its run long enough to become stoppable.
    let mut at = phoenix(10, 0);
    for _ in 0..12 {
        let r = record(at, 5.0, 5.0).with_channel("water_heater", 4.5);
        step(&rig, r).await;
        at = at + Duration::minutes(1);
    }
    assert_eq!(
        heater_device.read_state().await.unwrap().mode,
        WaterHeaterMode::Boost
    );

    // The car arrives nearly empty
    charger_device.plug_in();
    let r = record(at, 5.0, 5.0).with_channel("water_heater", 4.5);
    step(&rig, r).await;

    assert_eq!(
        heater_device.read_state().await.unwrap().mode,
        WaterHeaterMode::Timer,
        "the heater should be displaced"
    );
    assert!(
        charger_device.read_state().await.unwrap().charging,
        "the urgent charger should take its place"
    );
}

#[tokio::test]
async fn deadline_override_runs_on_grid_power() {
    // Overcast all day: production never covers the heater, and by late
    // afternoon the tank is still cold
    let rig = rig(phoenix(16, 30), 95.0);
    let heater_device = Arc::new(SimulatedWaterHeater::new(100.0, 0.4));
    let heater = Arc::new(WaterHeaterTask::new(
        heater_device.clone(),
        rig.planner.clone(),
        rig.clock.clone(),
        water_heater_config(),
        Priority::Low,
    ));
    rig.scheduler.register(heater).unwrap();

    step(&rig, record(phoenix(16, 30), 0.5, 0.3)).await;

    assert_eq!(
        heater_device.read_state().await.unwrap().mode,
        WaterHeaterMode::Boost,
        "the deadline override must start the heater on any ratio"
    );
}

/// Charger whose vendor API stopped answering
struct StalledCharger;

#[async_trait]
impl ChargerDevice for StalledCharger {
    async fn read_state(&self) -> Result<ChargerState, AdapterError> {
        Err(AdapterError::transport("connection reset"))
    }
    async fn set_current(&self, _amps: f64) -> Result<(), AdapterError> {
        Err(AdapterError::transport("connection reset"))
    }
    async fn start_charging(&self) -> Result<(), AdapterError> {
        Err(AdapterError::transport("connection reset"))
    }
    async fn stop_charging(&self) -> Result<(), AdapterError> {
        Err(AdapterError::transport("connection reset"))
    }
    fn capabilities(&self) -> ChargerCapabilities {
        ChargerCapabilities {
            min_current_amps: 6.0,
            max_current_amps: 40.0,
            voltage_v: 240.0,
            phases: 1,
        }
    }
}

#[tokio::test]
async fn stalled_adapter_is_sanitised_away() {
    let rig = rig(phoenix(10, 0), 95.0);

    let charger = Arc::new(CarChargerTask::new(
        Arc::new(StalledCharger),
        Arc::new(SimulatedCarSensor::new(50.0)),
        charger_config(),
        Priority::Low,
    ));
    let pool_device = Arc::new(SimulatedPoolSwitch::new());
    let pool = Arc::new(PoolPumpTask::new(
        pool_device.clone(),
        Arc::new(SimulatedPoolSensor::new(82.0)),
        Arc::new(StaticWeather::new(95.0, 5.0)),
        rig.planner.clone(),
        rig.store.clone(),
        rig.clock.clone(),
        pool_config(),
        Priority::Low,
    ));
    rig.scheduler.register(charger).unwrap();
    rig.scheduler.register(pool).unwrap();

    let mut at = phoenix(10, 0);
    for _ in 0..4 {
        step(&rig, record(at, 3.0, 0.3)).await;
        at = at + Duration::minutes(1);
    }

    let statuses = rig.scheduler.statuses().borrow().clone();
    assert!(
        !statuses.iter().any(|s| s.id == "car_charger"),
        "the stalled task must be dropped"
    );
    assert!(
        statuses.iter().any(|s| s.id == "pool_pump"),
        "healthy tasks keep being scheduled"
    );
    assert!(
        pool_device.read_state().await.unwrap().on,
        "the pool keeps absorbing the surplus as if the EV never existed"
    );
}

#[tokio::test]
async fn pool_quota_escalates_and_displaces_lower_priority() {
    let rig = rig(phoenix(14, 30), 95.0);
    let pool_device = Arc::new(SimulatedPoolSwitch::new());
    let pool = Arc::new(PoolPumpTask::new(
        pool_device.clone(),
        Arc::new(SimulatedPoolSensor::new(86.0)),
        Arc::new(StaticWeather::new(95.0, 5.0)),
        rig.planner.clone(),
        rig.store.clone(),
        rig.clock.clone(),
        pool_config(),
        Priority::Low,
    ));
    rig.scheduler.register(pool.clone()).unwrap();

    step(&rig, record(phoenix(14, 30), 2.5, 0.3)).await;

    assert_eq!(pool.priority(), Priority::High);
    assert!(pool_device.read_state().await.unwrap().on);
}

#[tokio::test]
async fn meter_outage_falls_back_to_the_simulator() {
    let rig = rig(phoenix(12, 0), 95.0);
    let device = Arc::new(SimulatedCharger::single_phase_240v());
    device.plug_in();
    let task = Arc::new(CarChargerTask::new(
        device.clone(),
        Arc::new(SimulatedCarSensor::new(50.0)),
        charger_config(),
        Priority::Low,
    ));
    rig.scheduler.register(task).unwrap();

    step(&rig, record(phoenix(12, 0), 6.0, 0.6)).await;
    assert!(device.read_state().await.unwrap().charging);

    // The meter goes dark past the gap; the PV simulator record keeps the
    // scheduler going
    rig.clock.advance(Duration::minutes(4));
    rig.simulator
        .enqueue(record(rig.clock.now(), 6.0, 5.8).with_channel("ev", 5.2));
    rig.scheduler.tick().await;

    assert!(!rig.scheduler.is_paused());
    assert_eq!(rig.scheduler.window_snapshot().len(), 2);
    assert!(device.read_state().await.unwrap().charging);
}

#[tokio::test]
async fn record_outage_stops_everything_until_data_returns() {
    let rig = rig(phoenix(12, 0), 95.0);
    let heater_device = Arc::new(SimulatedWaterHeater::new(112.0, 0.6));
    heater_device.boost(60).await.unwrap();
    let heater = Arc::new(WaterHeaterTask::new(
        heater_device.clone(),
        rig.planner.clone(),
        rig.clock.clone(),
        water_heater_config(),
        Priority::Low,
    ));
    rig.scheduler.register(heater).unwrap();

    // Seed one good record, then let both sources go dark past the gap
    step(&rig, record(phoenix(12, 0), 6.0, 5.0)).await;
    rig.clock.advance(Duration::minutes(4));
    rig.scheduler.tick().await;

    assert!(rig.scheduler.is_paused(), "no data means pause");
    assert_eq!(
        heater_device.read_state().await.unwrap().mode,
        WaterHeaterMode::Timer,
        "stop-all overrides the minimum run time"
    );

    // Records come back; the scheduler resumes with a fresh window
    rig.clock.advance(Duration::minutes(1));
    rig.meter
        .enqueue(record(rig.clock.now(), 6.0, 0.5));
    rig.scheduler.tick().await;
    assert!(!rig.scheduler.is_paused());
    assert_eq!(rig.scheduler.window_snapshot().len(), 1);
}

#[tokio::test]
async fn registration_rejects_overlapping_channel_keys() {
    let rig = rig(phoenix(10, 0), 95.0);
    let first = Arc::new(WaterHeaterTask::new(
        Arc::new(SimulatedWaterHeater::new(115.0, 0.8)),
        rig.planner.clone(),
        rig.clock.clone(),
        water_heater_config(),
        Priority::Low,
    ));
    let second = Arc::new(WaterHeaterTask::new(
        Arc::new(SimulatedWaterHeater::new(115.0, 0.8)),
        rig.planner.clone(),
        rig.clock.clone(),
        water_heater_config(),
        Priority::Low,
    ));
    rig.scheduler.register(first).unwrap();
    assert!(rig.scheduler.register(second).is_err());
}

#[tokio::test]
async fn pause_suppresses_starts_but_not_running_tasks() {
    let rig = rig(phoenix(12, 0), 95.0);
    let device = Arc::new(SimulatedCharger::single_phase_240v());
    device.plug_in();
    let task = Arc::new(CarChargerTask::new(
        device.clone(),
        Arc::new(SimulatedCarSensor::new(50.0)),
        charger_config(),
        Priority::Low,
    ));
    rig.scheduler.register(task).unwrap();

    rig.scheduler.pause();
    step(&rig, record(phoenix(12, 0), 6.0, 0.6)).await;
    assert!(
        !device.read_state().await.unwrap().charging,
        "paused scheduler must not start tasks"
    );

    rig.scheduler.resume();
    step(&rig, record(phoenix(12, 1), 6.0, 0.6)).await;
    assert!(device.read_state().await.unwrap().charging);
}
