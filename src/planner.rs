use chrono::{DateTime, Duration, DurationRound, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::Clock;
use crate::pv::PvPredictor;
use crate::sensor::{SeasonalWeather, WeatherService};
use crate::thermal::{HomeModel, HvacModel};

/// Trajectory the controlled value should follow from now to the target so
/// that passive drift thereafter still reaches the goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveCurve {
    pub start_time: DateTime<FixedOffset>,
    pub start_value: f64,
    pub end_time: DateTime<FixedOffset>,
    pub end_value: f64,
    pub deadband: f64,
}

impl PassiveCurve {
    /// Curve value at `at`, clamped to the endpoints outside the span
    pub fn value_at(&self, at: DateTime<FixedOffset>) -> f64 {
        if at <= self.start_time {
            return self.start_value;
        }
        if at >= self.end_time {
            return self.end_value;
        }
        let span = (self.end_time - self.start_time).num_seconds() as f64;
        let frac = (at - self.start_time).num_seconds() as f64 / span;
        self.start_value + (self.end_value - self.start_value) * frac
    }

    /// True when `value` is more than the deadband above the curve
    pub fn is_above(&self, at: DateTime<FixedOffset>, value: f64) -> bool {
        value > self.value_at(at) + self.deadband
    }

    /// True when `value` is more than the deadband below the curve
    pub fn is_below(&self, at: DateTime<FixedOffset>, value: f64) -> bool {
        value < self.value_at(at) - self.deadband
    }
}

/// A deadline-bound task's plan for the day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlinePlan {
    /// Latest instant today the PV array still covers the task
    pub target_time: DateTime<FixedOffset>,
    /// Value the controlled state must reach by `target_time`
    pub target_value: f64,
    pub curve: PassiveCurve,
}

/// Target-time and passive-curve computations shared by the water heater,
/// HVAC and pool pump tasks.
pub struct DeadlinePlanner {
    pv: Arc<PvPredictor>,
    weather: Arc<dyn WeatherService>,
    clock: Arc<dyn Clock>,
}

impl DeadlinePlanner {
    pub fn new(
        pv: Arc<PvPredictor>,
        weather: Arc<dyn WeatherService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { pv, weather, clock }
    }

    async fn outdoor_temp_at(&self, at: DateTime<FixedOffset>) -> f64 {
        match self.weather.conditions_at(at).await {
            Ok(conditions) => conditions.temperature,
            Err(_) => SeasonalWeather::conditions_for(at).temperature,
        }
    }

    /// Maximum production still expected between now and dusk
    pub async fn max_available_power(&self) -> f64 {
        self.pv.max_available_power().await
    }

    /// Latest instant today when the PV array is still forecast to supply
    /// `power`. None when no instant of the remaining day qualifies.
    pub async fn latest_power_time(&self, power: f64) -> Option<DateTime<FixedOffset>> {
        let (start, end) = self.pv.next_power_window(power).await;
        (start != end).then_some(end)
    }

    /// Target time for the HVAC: its power need depends on the outdoor
    /// temperature at the target, so iterate window end and model power to a
    /// fixpoint.
    pub async fn hvac_target_time(&self, model: &HvacModel) -> Option<DateTime<FixedOffset>> {
        let mut power = self.pv.max_available_power().await - 1e-4;
        let mut end = None;
        for _ in 0..8 {
            end = Some(self.latest_power_time(power).await?);
            let outdoor = self.outdoor_temp_at(end.unwrap()).await;
            let hvac_power = model.power(outdoor);
            if hvac_power >= power {
                break;
            }
            power = hvac_power;
        }
        debug!(target_time = ?end, "HVAC target time updated");
        end
    }

    /// Value the state must hold at `target_time` so that passive drift
    /// alone reaches `goal_value` at `goal_time`, clamped into the comfort
    /// zone. Walks backward minute by minute under forecast outdoor
    /// temperatures.
    pub async fn backward_target_value(
        &self,
        home: &HomeModel,
        target_time: DateTime<FixedOffset>,
        goal_time: DateTime<FixedOffset>,
        goal_value: f64,
        comfort_zone: [f64; 2],
    ) -> f64 {
        let minutes = (goal_time - target_time).num_minutes().max(0);

        // One forecast fetch per hour of the span; drift integrates per minute
        let mut hourly: HashMap<i64, f64> = HashMap::new();
        let hour_anchor = target_time
            .duration_round(Duration::hours(1))
            .unwrap_or(target_time);
        for hour in 0..=(minutes / 60 + 1) {
            let at = hour_anchor + Duration::hours(hour);
            let temp = self.outdoor_temp_at(at).await;
            hourly.insert(hour, temp);
        }

        let mut value = goal_value;
        for minute in 0..minutes {
            let at = goal_time - Duration::minutes(minute);
            let hour = ((at - hour_anchor).num_minutes() / 60).clamp(0, minutes / 60 + 1);
            let outdoor = hourly[&hour];
            value -= home.degree_per_minute(value, outdoor);
        }
        value.clamp(comfort_zone[0], comfort_zone[1])
    }

    /// Assemble the plan: interpolate from the current state at "now" to the
    /// target state at `target_time`.
    pub fn plan(
        &self,
        target_time: DateTime<FixedOffset>,
        target_value: f64,
        now_value: f64,
        deadband: f64,
    ) -> DeadlinePlan {
        let now = self.clock.now();
        DeadlinePlan {
            target_time,
            target_value,
            curve: PassiveCurve {
                start_time: now,
                start_value: now_value,
                end_time: target_time,
                end_value: target_value,
                deadband,
            },
        }
    }
}
