use anyhow::{Context, Result};
use chrono::NaiveTime;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    pub adapter: AdapterConfig,

    #[validate(nested)]
    pub watchdog: WatchdogConfig,

    #[validate(nested)]
    pub pv: PvConfig,

    #[validate(nested)]
    pub weather: WeatherConfig,

    #[validate(nested)]
    pub store: StoreConfig,

    #[validate(nested)]
    pub tasks: TasksConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    /// Scheduling period in seconds
    #[serde(default = "default_tick_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub tick_interval_secs: u64,

    /// Sliding window length in records
    #[serde(default = "default_window_size")]
    #[validate(range(min = 1, max = 1440))]
    pub window_size: usize,

    /// Minutes without a power record before falling back to the simulator
    #[serde(default = "default_max_record_gap_minutes")]
    #[validate(range(min = 1, max = 60))]
    pub max_record_gap_minutes: i64,

    /// Per-channel noise floor in kW; readings below it count as zero
    #[serde(default)]
    pub ignore_power_threshold: HashMap<String, f64>,

    /// Noise floor applied to channels without an explicit threshold
    #[serde(default = "default_ignore_power_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub default_ignore_power_threshold: f64,
}

impl SchedulerConfig {
    pub fn threshold_for(&self, key: &str) -> f64 {
        self.ignore_power_threshold
            .get(key)
            .copied()
            .unwrap_or(self.default_ignore_power_threshold)
    }
}

/// Remote adapter call bounds
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AdapterConfig {
    /// Per-remote-call timeout in seconds
    #[serde(default = "default_adapter_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub timeout_secs: u64,

    /// Consecutive failed observations before a task is dropped
    #[serde(default = "default_stale_limit")]
    #[validate(range(min = 1, max = 10))]
    pub stale_limit: u32,
}

/// External watchdog expectations; liveness enforcement is environmental
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_timeout_secs")]
    #[validate(range(min = 30, max = 3600))]
    pub timeout_secs: u64,
}

/// PV array geometry and electrical parameters
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvConfig {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    /// Panel tilt from horizontal, degrees
    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt: f64,

    /// Panel azimuth, degrees from north (180 = south)
    #[validate(range(min = 0.0, max = 360.0))]
    pub azimuth: f64,

    #[validate(range(min = 1, max = 100))]
    pub modules_per_string: u32,

    #[validate(range(min = 1, max = 100))]
    pub strings: u32,

    /// Module nameplate power at reference conditions, watts
    #[serde(default = "default_module_power_w")]
    #[validate(range(min = 50.0, max = 1000.0))]
    pub module_power_w: f64,

    /// Power temperature coefficient, 1/°C (negative)
    #[serde(default = "default_temperature_coefficient")]
    #[validate(range(min = -0.01, max = 0.0))]
    pub temperature_coefficient: f64,

    /// Inverter AC output ceiling, kW
    #[serde(default = "default_inverter_peak_kw")]
    #[validate(range(min = 0.1, max = 100.0))]
    pub inverter_peak_kw: f64,

    /// Commissioning date, ISO 8601 day
    #[serde(default)]
    pub installation_date: Option<chrono::NaiveDate>,

    /// Output degradation over the first year, percent
    #[serde(default = "default_first_year_degradation")]
    #[validate(range(min = 0.0, max = 10.0))]
    pub first_year_degradation: f64,

    /// Output degradation per subsequent year, percent
    #[serde(default = "default_other_year_degradation")]
    #[validate(range(min = 0.0, max = 5.0))]
    pub other_year_degradation: f64,

    /// House base load subtracted from availability estimates, kW
    #[serde(default = "default_base_power_kw")]
    #[validate(range(min = 0.0, max = 10.0))]
    pub base_power_kw: f64,

    /// Forecast temperature change (°F) that invalidates the day memo
    #[serde(default = "default_forecast_epsilon")]
    #[validate(range(min = 0.1, max = 20.0))]
    pub forecast_epsilon: f64,
}

/// Weather forecast endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WeatherConfig {
    #[validate(length(min = 1))]
    pub api_url: String,

    #[serde(default = "default_weather_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub timeout_secs: u64,

    /// Hours between forecast reloads
    #[serde(default = "default_refresh_hours")]
    #[validate(range(min = 1, max = 24))]
    pub refresh_hours: i64,
}

/// Key/value store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// Per-task settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TasksConfig {
    #[validate(nested)]
    pub car_charger: CarChargerConfig,

    #[validate(nested)]
    pub water_heater: WaterHeaterConfig,

    #[validate(nested)]
    pub hvac: HvacConfig,

    #[validate(nested)]
    pub pool_pump: PoolPumpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CarChargerConfig {
    #[serde(default = "default_ev_key")]
    pub power_key: String,

    /// SoC (percent) below which each priority level applies
    #[serde(default = "default_charger_priority_table")]
    pub priority_table: SocPriorityTable,

    /// Charging stops once the car reports this state of charge, percent
    #[serde(default = "default_max_state_of_charge")]
    #[validate(range(min = 10.0, max = 100.0))]
    pub max_state_of_charge: f64,

    /// Fast set-point adjustment cadence, seconds
    #[serde(default = "default_charger_cycle_secs")]
    #[validate(range(min = 5, max = 60))]
    pub cycle_secs: u64,
}

/// SoC thresholds for the charger priority ladder
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocPriorityTable {
    pub urgent_below: f64,
    pub high_below: f64,
    pub medium_below: f64,
    pub low_below: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WaterHeaterConfig {
    #[serde(default = "default_water_heater_key")]
    pub power_key: String,

    /// Element draw when heating, kW
    #[serde(default = "default_water_heater_power")]
    #[validate(range(min = 0.5, max = 10.0))]
    pub power_kw: f64,

    #[serde(default = "default_minutes_per_degree")]
    #[validate(range(min = 0.1, max = 30.0))]
    pub minutes_per_degree: f64,

    /// Tank set-point, °F
    #[serde(default = "default_desired_temperature")]
    #[validate(range(min = 100.0, max = 140.0))]
    pub desired_temperature: f64,

    #[serde(default = "default_wh_min_run_secs")]
    pub min_run_time_secs: u64,

    /// Cool-down after a no-power observation, seconds
    #[serde(default = "default_no_power_delay_secs")]
    pub no_power_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HvacConfig {
    #[serde(default = "default_hvac_keys")]
    pub power_keys: Vec<String>,

    #[serde(default = "default_hvac_min_run_secs")]
    pub min_run_time_secs: u64,

    /// Pause between two runs, seconds
    #[serde(default = "default_hvac_min_pause_secs")]
    pub min_pause_secs: u64,

    /// Hold set-point overshoot past the target, °F
    #[serde(default = "default_temperature_offset")]
    #[validate(range(min = 0.0, max = 10.0))]
    pub temperature_offset: f64,

    /// Time of day by which the comfort goal must hold
    #[serde(default = "default_goal_time")]
    pub goal_time: NaiveTime,

    /// Indoor temperature wanted at goal_time, °F
    #[serde(default = "default_goal_temperature")]
    #[validate(range(min = 50.0, max = 90.0))]
    pub goal_temperature: f64,

    /// Acceptable indoor range the target is clamped into, °F
    #[serde(default = "default_comfort_zone")]
    pub comfort_zone: [f64; 2],

    /// Curve-crossing deadband, °F
    #[serde(default = "default_curve_deadband")]
    #[validate(range(min = 0.0, max = 5.0))]
    pub curve_deadband: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PoolPumpConfig {
    #[serde(default = "default_pool_key")]
    pub power_key: String,

    /// Pump draw, kW
    #[serde(default = "default_pool_power")]
    #[validate(range(min = 0.1, max = 10.0))]
    pub power_kw: f64,

    #[serde(default = "default_pool_min_run_secs")]
    pub min_run_time_secs: u64,

    /// Mean pump power below which the filter is considered dirty, kW
    #[serde(default = "default_clean_filter_threshold")]
    #[validate(range(min = 0.1, max = 10.0))]
    pub clean_filter_threshold: f64,

    /// Water temperature (°F) to daily run time (minutes) curve endpoints
    #[serde(default = "default_runtime_curve")]
    pub runtime_curve: [[f64; 2]; 2],
}

/// Telemetry and observability configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

// Default value functions
fn default_tick_interval_secs() -> u64 { 60 }
fn default_window_size() -> usize { 60 }
fn default_max_record_gap_minutes() -> i64 { 3 }
fn default_ignore_power_threshold() -> f64 { 0.1 }
fn default_adapter_timeout_secs() -> u64 { 3 }
fn default_stale_limit() -> u32 { 3 }
fn default_watchdog_timeout_secs() -> u64 { 180 }
fn default_module_power_w() -> f64 { 335.0 }
fn default_temperature_coefficient() -> f64 { -0.0025 }
fn default_inverter_peak_kw() -> f64 { 6.06 }
fn default_first_year_degradation() -> f64 { 2.0 }
fn default_other_year_degradation() -> f64 { 0.33 }
fn default_base_power_kw() -> f64 { 0.4 }
fn default_forecast_epsilon() -> f64 { 2.0 }
fn default_weather_timeout_secs() -> u64 { 3 }
fn default_refresh_hours() -> i64 { 1 }
fn default_ev_key() -> String { "ev".to_string() }
fn default_charger_priority_table() -> SocPriorityTable {
    SocPriorityTable {
        urgent_below: 40.0,
        high_below: 55.0,
        medium_below: 70.0,
        low_below: 101.0,
    }
}
fn default_max_state_of_charge() -> f64 { 79.6 }
fn default_charger_cycle_secs() -> u64 { 15 }
fn default_water_heater_key() -> String { "water_heater".to_string() }
fn default_water_heater_power() -> f64 { 4.65 }
fn default_minutes_per_degree() -> f64 { 2.0 }
fn default_desired_temperature() -> f64 { 125.0 }
fn default_wh_min_run_secs() -> u64 { 600 }
fn default_no_power_delay_secs() -> u64 { 1800 }
fn default_hvac_keys() -> Vec<String> { vec!["a_c".to_string(), "air_handler".to_string()] }
fn default_hvac_min_run_secs() -> u64 { 420 }
fn default_hvac_min_pause_secs() -> u64 { 300 }
fn default_temperature_offset() -> f64 { 2.0 }
fn default_goal_time() -> NaiveTime { NaiveTime::from_hms_opt(22, 30, 0).unwrap() }
fn default_goal_temperature() -> f64 { 73.0 }
fn default_comfort_zone() -> [f64; 2] { [71.0, 78.0] }
fn default_curve_deadband() -> f64 { 0.2 }
fn default_pool_key() -> String { "pool".to_string() }
fn default_pool_power() -> f64 { 2.0 }
fn default_pool_min_run_secs() -> u64 { 420 }
fn default_clean_filter_threshold() -> f64 { 1.55 }
fn default_runtime_curve() -> [[f64; 2]; 2] { [[52.0, 60.0], [75.0, 300.0]] }
fn default_log_level() -> String { "info".to_string() }

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/<environment>.toml when an environment is supplied
    /// 3. Environment variables with SAS__ prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    /// Load configuration with a specific environment override
    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            let env_file = format!("config/{}.toml", env);
            figment = figment.merge(Toml::file(env_file));
        }

        // SAS__SCHEDULER__TICK_INTERVAL_SECS -> scheduler.tick_interval_secs
        figment = figment.merge(Env::prefixed("SAS__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}

pub type Config = AppConfig;
