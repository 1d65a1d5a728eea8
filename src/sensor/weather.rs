use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::WeatherConfig;
use crate::domain::{AdapterError, Clock};

/// Instantaneous or forecast weather conditions.
///
/// Temperatures are °F and wind speeds mph, matching the units the thermal
/// models and the PV cell-temperature derating were fitted against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeatherConditions {
    pub temperature: f64,
    pub wind_speed: f64,
}

/// Weather forecast source
#[async_trait]
pub trait WeatherService: Send + Sync {
    async fn current(&self) -> Result<WeatherConditions, AdapterError>;

    async fn conditions_at(
        &self,
        at: DateTime<FixedOffset>,
    ) -> Result<WeatherConditions, AdapterError>;

    /// Minimum forecast temperature over the next `hours` hours
    async fn minimum_temperature(&self, hours: u32) -> Result<f64, AdapterError>;

    /// Maximum forecast temperature over the next `hours` hours
    async fn maximum_temperature(&self, hours: u32) -> Result<f64, AdapterError>;
}

/// One hourly period of the upstream forecast payload
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastPeriod {
    pub start_time: DateTime<FixedOffset>,
    pub temperature: f64,
    pub wind_speed: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastPayload {
    periods: Vec<ForecastPeriod>,
}

struct ForecastData {
    periods: Vec<ForecastPeriod>,
    loaded_at: DateTime<FixedOffset>,
}

/// Hourly-forecast HTTP client with linear interpolation between periods.
///
/// The forecast is reloaded at most every `refresh_hours`; between reloads
/// every query interpolates the cached periods. A payload whose first period
/// is more than two hours stale is rejected.
pub struct HttpWeatherService {
    client: reqwest::Client,
    url: String,
    refresh: Duration,
    clock: std::sync::Arc<dyn Clock>,
    data: Mutex<Option<ForecastData>>,
}

impl HttpWeatherService {
    pub fn new(cfg: &WeatherConfig, clock: std::sync::Arc<dyn Clock>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            url: cfg.api_url.clone(),
            refresh: Duration::hours(cfg.refresh_hours),
            clock,
            data: Mutex::new(None),
        }
    }

    async fn ensure_loaded(&self) -> Result<(), AdapterError> {
        let now = self.clock.now();
        {
            let data = self.data.lock().unwrap();
            if let Some(data) = data.as_ref() {
                if now - data.loaded_at < self.refresh {
                    return Ok(());
                }
            }
        }
        debug!("loading weather forecast data");
        let payload: ForecastPayload = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(AdapterError::transport)?
            .error_for_status()
            .map_err(AdapterError::transport)?
            .json()
            .await
            .map_err(AdapterError::protocol)?;
        let first = payload
            .periods
            .first()
            .ok_or_else(|| AdapterError::protocol("empty forecast"))?;
        if now > first.start_time + Duration::hours(2) {
            warn!(start = %first.start_time, "forecast period is outdated");
            return Err(AdapterError::protocol("stale forecast data"));
        }
        *self.data.lock().unwrap() = Some(ForecastData {
            periods: payload.periods,
            loaded_at: now,
        });
        Ok(())
    }

    fn interpolate(&self, at: DateTime<FixedOffset>) -> Result<WeatherConditions, AdapterError> {
        let data = self.data.lock().unwrap();
        let periods = &data
            .as_ref()
            .ok_or_else(|| AdapterError::protocol("no forecast data"))?
            .periods;
        interpolate_periods(periods, at)
            .ok_or_else(|| AdapterError::protocol(format!("no forecast data for {at}")))
    }

    async fn temperatures(&self, hours: u32) -> Result<Vec<f64>, AdapterError> {
        self.ensure_loaded().await?;
        let now = self.clock.now();
        let mut temps = Vec::with_capacity(hours as usize);
        for hour in 0..hours {
            let conditions = self.interpolate(now + Duration::hours(hour as i64))?;
            temps.push(conditions.temperature);
        }
        Ok(temps)
    }
}

pub(crate) fn interpolate_periods(
    periods: &[ForecastPeriod],
    at: DateTime<FixedOffset>,
) -> Option<WeatherConditions> {
    let (first, last) = (periods.first()?, periods.last()?);
    if at <= first.start_time {
        return Some(WeatherConditions {
            temperature: first.temperature,
            wind_speed: first.wind_speed,
        });
    }
    if at >= last.start_time {
        return Some(WeatherConditions {
            temperature: last.temperature,
            wind_speed: last.wind_speed,
        });
    }
    let after = periods.iter().position(|p| p.start_time > at)?;
    let (lo, hi) = (&periods[after - 1], &periods[after]);
    let span = (hi.start_time - lo.start_time).num_seconds() as f64;
    let frac = (at - lo.start_time).num_seconds() as f64 / span;
    Some(WeatherConditions {
        temperature: lo.temperature + (hi.temperature - lo.temperature) * frac,
        wind_speed: lo.wind_speed + (hi.wind_speed - lo.wind_speed) * frac,
    })
}

#[async_trait]
impl WeatherService for HttpWeatherService {
    async fn current(&self) -> Result<WeatherConditions, AdapterError> {
        self.ensure_loaded().await?;
        self.interpolate(self.clock.now())
    }

    async fn conditions_at(
        &self,
        at: DateTime<FixedOffset>,
    ) -> Result<WeatherConditions, AdapterError> {
        self.ensure_loaded().await?;
        self.interpolate(at)
    }

    async fn minimum_temperature(&self, hours: u32) -> Result<f64, AdapterError> {
        let temps = self.temperatures(hours).await?;
        temps
            .into_iter()
            .fold(None, |min: Option<f64>, t| {
                Some(min.map_or(t, |m| m.min(t)))
            })
            .ok_or_else(|| AdapterError::protocol("no forecast data"))
    }

    async fn maximum_temperature(&self, hours: u32) -> Result<f64, AdapterError> {
        let temps = self.temperatures(hours).await?;
        temps
            .into_iter()
            .fold(None, |max: Option<f64>, t| {
                Some(max.map_or(t, |m| m.max(t)))
            })
            .ok_or_else(|| AdapterError::protocol("no forecast data"))
    }
}

/// Monthly-average conditions used when the forecast service is down.
/// Estimates derived from these are tagged degraded.
pub struct SeasonalWeather;

/// (°F, mph) monthly normals, January first
const SEASONAL_NORMALS: [(f64, f64); 12] = [
    (56.0, 5.0),
    (60.0, 6.0),
    (66.0, 7.0),
    (74.0, 7.0),
    (84.0, 7.0),
    (94.0, 7.0),
    (97.0, 8.0),
    (95.0, 8.0),
    (90.0, 7.0),
    (78.0, 6.0),
    (65.0, 5.0),
    (55.0, 5.0),
];

impl SeasonalWeather {
    pub fn conditions_for(at: DateTime<FixedOffset>) -> WeatherConditions {
        let (temperature, wind_speed) = SEASONAL_NORMALS[at.month0() as usize];
        WeatherConditions {
            temperature,
            wind_speed,
        }
    }
}

#[async_trait]
impl WeatherService for SeasonalWeather {
    async fn current(&self) -> Result<WeatherConditions, AdapterError> {
        Err(AdapterError::transport("seasonal fallback has no live data"))
    }

    async fn conditions_at(
        &self,
        at: DateTime<FixedOffset>,
    ) -> Result<WeatherConditions, AdapterError> {
        Ok(Self::conditions_for(at))
    }

    async fn minimum_temperature(&self, _hours: u32) -> Result<f64, AdapterError> {
        Err(AdapterError::transport("seasonal fallback has no live data"))
    }

    async fn maximum_temperature(&self, _hours: u32) -> Result<f64, AdapterError> {
        Err(AdapterError::transport("seasonal fallback has no live data"))
    }
}

/// Fixed conditions for tests and simulation
pub struct StaticWeather {
    pub conditions: WeatherConditions,
}

impl StaticWeather {
    pub fn new(temperature: f64, wind_speed: f64) -> Self {
        Self {
            conditions: WeatherConditions {
                temperature,
                wind_speed,
            },
        }
    }
}

#[async_trait]
impl WeatherService for StaticWeather {
    async fn current(&self) -> Result<WeatherConditions, AdapterError> {
        Ok(self.conditions)
    }

    async fn conditions_at(
        &self,
        _at: DateTime<FixedOffset>,
    ) -> Result<WeatherConditions, AdapterError> {
        Ok(self.conditions)
    }

    async fn minimum_temperature(&self, _hours: u32) -> Result<f64, AdapterError> {
        Ok(self.conditions.temperature)
    }

    async fn maximum_temperature(&self, _hours: u32) -> Result<f64, AdapterError> {
        Ok(self.conditions.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 21, hour, minute, 0)
            .unwrap()
    }

    fn periods() -> Vec<ForecastPeriod> {
        vec![
            ForecastPeriod {
                start_time: at(10, 0),
                temperature: 80.0,
                wind_speed: 5.0,
            },
            ForecastPeriod {
                start_time: at(11, 0),
                temperature: 90.0,
                wind_speed: 7.0,
            },
        ]
    }

    #[test]
    fn test_interpolation_between_periods() {
        let conditions = interpolate_periods(&periods(), at(10, 30)).unwrap();
        assert!((conditions.temperature - 85.0).abs() < 1e-9);
        assert!((conditions.wind_speed - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation_clamps_outside_range() {
        let before = interpolate_periods(&periods(), at(8, 0)).unwrap();
        assert_eq!(before.temperature, 80.0);
        let after = interpolate_periods(&periods(), at(13, 0)).unwrap();
        assert_eq!(after.temperature, 90.0);
    }

    #[test]
    fn test_seasonal_normals_cover_the_year() {
        let summer = SeasonalWeather::conditions_for(at(12, 0));
        assert!(summer.temperature > 80.0);
        let winter_ts = FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
            .unwrap();
        let winter = SeasonalWeather::conditions_for(winter_ts);
        assert!(winter.temperature < summer.temperature);
    }

    #[tokio::test]
    async fn test_static_weather_answers_everything() {
        let weather = StaticWeather::new(95.0, 6.0);
        assert_eq!(weather.current().await.unwrap().temperature, 95.0);
        assert_eq!(weather.minimum_temperature(24).await.unwrap(), 95.0);
    }
}
