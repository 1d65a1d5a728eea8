use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use solar_appliance_scheduler::api::{self, ApiState};
use solar_appliance_scheduler::config::Config;
use solar_appliance_scheduler::domain::{Clock, Priority, SystemClock, Task};
use solar_appliance_scheduler::planner::DeadlinePlanner;
use solar_appliance_scheduler::pv::{PvArray, PvPredictor};
use solar_appliance_scheduler::scheduler::{Scheduler, SchedulerSettings, LAST_PRIORITIES_KEY};
use solar_appliance_scheduler::sensor::{
    HttpWeatherService, PowerMeter, SimulatedCarSensor, SimulatedPoolSensor, SimulatedPowerMeter,
    WeatherService,
};
use solar_appliance_scheduler::store::Store;
use solar_appliance_scheduler::tasks::{
    CarChargerTask, HvacMode, HvacTask, PoolPumpTask, SimulatedCharger, SimulatedPoolSwitch,
    SimulatedThermostat, SimulatedWaterHeater, WaterHeaterTask,
};
use solar_appliance_scheduler::telemetry;
use solar_appliance_scheduler::thermal::{HomeModel, HvacModel};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;
    telemetry::init_tracing(&cfg.telemetry);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(Store::open(&cfg.store.path).context("cannot open the store")?);
    let weather: Arc<dyn WeatherService> =
        Arc::new(HttpWeatherService::new(&cfg.weather, clock.clone()));
    let predictor = Arc::new(PvPredictor::new(
        PvArray::new(&cfg.pv),
        weather.clone(),
        clock.clone(),
        cfg.pv.forecast_epsilon,
    ));
    let planner = Arc::new(DeadlinePlanner::new(
        predictor.clone(),
        weather.clone(),
        clock.clone(),
    ));
    let hvac_model = Arc::new(HvacModel::load(&store));
    let home_model = Arc::new(HomeModel::load(&store));

    // Last-known priorities warm the first ticks after a restart
    let warm: HashMap<String, Priority> = store.get(LAST_PRIORITIES_KEY).unwrap_or_default();
    let warm = |id: &str| warm.get(id).copied().unwrap_or(Priority::Low);

    let charger_device = Arc::new(SimulatedCharger::single_phase_240v());
    let car_sensor = Arc::new(SimulatedCarSensor::new(50.0));
    let car_charger = Arc::new(CarChargerTask::new(
        charger_device,
        car_sensor,
        cfg.tasks.car_charger.clone(),
        warm("car_charger"),
    ));

    let water_heater: Arc<dyn Task> = Arc::new(WaterHeaterTask::new(
        Arc::new(SimulatedWaterHeater::new(120.0, 0.9)),
        planner.clone(),
        clock.clone(),
        cfg.tasks.water_heater.clone(),
        warm("water_heater"),
    ));

    let hvac: Arc<dyn Task> = Arc::new(HvacTask::new(
        Arc::new(SimulatedThermostat::new(76.0, HvacMode::Cool)),
        planner.clone(),
        weather.clone(),
        hvac_model,
        home_model,
        clock.clone(),
        cfg.tasks.hvac.clone(),
        warm("hvac"),
    ));

    let pool_pump: Arc<dyn Task> = Arc::new(PoolPumpTask::new(
        Arc::new(SimulatedPoolSwitch::new()),
        Arc::new(SimulatedPoolSensor::new(82.0)),
        weather.clone(),
        planner.clone(),
        store.clone(),
        clock.clone(),
        cfg.tasks.pool_pump.clone(),
        warm("pool_pump"),
    ));

    let simulator = Arc::new(SimulatedPowerMeter::new(
        predictor.clone(),
        clock.clone(),
        cfg.pv.base_power_kw,
    ));
    // The simulator doubles as the meter until a hardware meter adapter is
    // wired in
    let meter: Arc<dyn PowerMeter> = simulator.clone();

    let (settings, thresholds) = SchedulerSettings::from_config(&cfg);
    let scheduler = Arc::new(Scheduler::new(
        clock,
        meter.clone(),
        simulator.clone(),
        predictor.clone(),
        store,
        settings,
        thresholds,
    ));
    simulator.attach_statuses(scheduler.statuses());

    scheduler
        .register(car_charger.clone())
        .context("registering the car charger")?;
    scheduler
        .register(water_heater)
        .context("registering the water heater")?;
    scheduler.register(hvac).context("registering the HVAC")?;
    scheduler
        .register(pool_pump)
        .context("registering the pool pump")?;

    tokio::spawn(scheduler.clone().run());
    let _adjust_loop = car_charger.spawn_fast_adjust(meter);

    let app = api::router(ApiState {
        scheduler: scheduler.clone(),
        predictor,
    });
    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting the solar appliance scheduler");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    scheduler.stop_all().await;
    warn!("shutdown complete");
    Ok(())
}
