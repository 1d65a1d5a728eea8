use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::domain::Clock;
use crate::sensor::{SeasonalWeather, WeatherConditions, WeatherService};

use super::model::PvArray;

const MINUTES_PER_DAY: usize = 24 * 60;

/// Minute-resolution clear-sky production curve for one calendar day
struct DayCurve {
    date: NaiveDate,
    start: DateTime<FixedOffset>,
    samples: Vec<f64>,
    noon_temperature: f64,
    degraded: bool,
}

impl DayCurve {
    fn minute_index(&self, at: DateTime<FixedOffset>) -> Option<usize> {
        let minutes = (at - self.start).num_minutes();
        if (0..MINUTES_PER_DAY as i64).contains(&minutes) {
            Some(minutes as usize)
        } else {
            None
        }
    }

    fn time_at(&self, index: usize) -> DateTime<FixedOffset> {
        self.start + Duration::minutes(index as i64)
    }

    /// Linear interpolation between the minute samples
    fn power_at(&self, at: DateTime<FixedOffset>) -> Option<f64> {
        let index = self.minute_index(at)?;
        let base = self.samples[index];
        if index + 1 >= self.samples.len() {
            return Some(base);
        }
        let frac = (at - self.time_at(index)).num_seconds() as f64 / 60.0;
        Some(base + (self.samples[index + 1] - base) * frac)
    }

    /// First and last minute with any production
    fn daytime(&self) -> Option<(usize, usize)> {
        let dawn = self.samples.iter().position(|&p| p > 0.0)?;
        let dusk = self.samples.iter().rposition(|&p| p > 0.0)?;
        Some((dawn, dusk))
    }
}

/// Forward production queries against the PV array model.
///
/// A per-day minute curve is memoised and recomputed when the day rolls
/// over or `refresh` observes the forecast temperature drifting past the
/// configured epsilon. When the weather service is unreachable the curve is
/// built from seasonal normals and estimates are tagged degraded.
pub struct PvPredictor {
    array: PvArray,
    weather: Arc<dyn WeatherService>,
    clock: Arc<dyn Clock>,
    forecast_epsilon: f64,
    memo: RwLock<Option<Arc<DayCurve>>>,
    degraded: AtomicBool,
}

impl PvPredictor {
    pub fn new(
        array: PvArray,
        weather: Arc<dyn WeatherService>,
        clock: Arc<dyn Clock>,
        forecast_epsilon: f64,
    ) -> Self {
        Self {
            array,
            weather,
            clock,
            forecast_epsilon,
            memo: RwLock::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    /// True when the latest estimates were produced from seasonal normals
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn forecast_or_seasonal(
        &self,
        at: DateTime<FixedOffset>,
        degraded: &mut bool,
    ) -> WeatherConditions {
        match self.weather.conditions_at(at).await {
            Ok(conditions) => conditions,
            Err(err) => {
                if !*degraded {
                    warn!(error = %err, "weather unavailable, using seasonal averages");
                }
                *degraded = true;
                SeasonalWeather::conditions_for(at)
            }
        }
    }

    async fn build_curve(&self, date: NaiveDate) -> Arc<DayCurve> {
        let offset = *self.clock.now().offset();
        let start = date
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_local_timezone(offset)
            .unwrap();
        let mut degraded = false;

        // Hourly forecast conditions, held constant within each hour
        let mut hourly = Vec::with_capacity(25);
        for hour in 0..=24 {
            let at = start + Duration::hours(hour);
            hourly.push(self.forecast_or_seasonal(at, &mut degraded).await);
        }

        let mut samples = Vec::with_capacity(MINUTES_PER_DAY);
        for minute in 0..MINUTES_PER_DAY {
            let at = start + Duration::minutes(minute as i64);
            let (lo, hi) = (&hourly[minute / 60], &hourly[minute / 60 + 1]);
            let frac = (minute % 60) as f64 / 60.0;
            let temperature = lo.temperature + (hi.temperature - lo.temperature) * frac;
            let wind = lo.wind_speed + (hi.wind_speed - lo.wind_speed) * frac;
            samples.push(self.array.power_at(at, temperature, wind));
        }

        let noon_temperature = hourly[12].temperature;
        self.degraded.store(degraded, Ordering::Relaxed);
        debug!(%date, degraded, "rebuilt PV day curve");
        Arc::new(DayCurve {
            date,
            start,
            samples,
            noon_temperature,
            degraded,
        })
    }

    async fn curve(&self) -> Arc<DayCurve> {
        let today = self.clock.now().date_naive();
        if let Some(curve) = self.memo.read().unwrap().clone() {
            if curve.date == today {
                return curve;
            }
        }
        let curve = self.build_curve(today).await;
        *self.memo.write().unwrap() = Some(curve.clone());
        curve
    }

    /// Re-check memo validity against the forecast; called once per tick.
    ///
    /// Invalidates the day curve when the forecast temperature at solar noon
    /// moved more than the configured epsilon, or when the curve was built
    /// degraded and the forecast is reachable again.
    pub async fn refresh(&self) {
        let curve = match self.memo.read().unwrap().clone() {
            Some(c) => c,
            None => return,
        };
        let noon = curve.start + Duration::hours(12);
        match self.weather.conditions_at(noon).await {
            Ok(conditions) => {
                let drift = (conditions.temperature - curve.noon_temperature).abs();
                if curve.degraded || drift > self.forecast_epsilon {
                    debug!(drift, "forecast changed, flushing PV day curve");
                    *self.memo.write().unwrap() = None;
                }
            }
            Err(_) => {}
        }
    }

    /// Expected production at `at`, under forecast or supplied weather
    pub async fn power_at(
        &self,
        at: DateTime<FixedOffset>,
        temp_air_f: Option<f64>,
        wind_speed_mph: Option<f64>,
    ) -> f64 {
        if temp_air_f.is_none() && wind_speed_mph.is_none() {
            if let Some(power) = self.curve().await.power_at(at) {
                return power;
            }
        }
        let mut degraded = self.is_degraded();
        let conditions = match (temp_air_f, wind_speed_mph) {
            (Some(t), Some(w)) => WeatherConditions {
                temperature: t,
                wind_speed: w,
            },
            (t, w) => {
                let forecast = self.forecast_or_seasonal(at, &mut degraded).await;
                self.degraded.store(degraded, Ordering::Relaxed);
                WeatherConditions {
                    temperature: t.unwrap_or(forecast.temperature),
                    wind_speed: w.unwrap_or(forecast.wind_speed),
                }
            }
        };
        self.array
            .power_at(at, conditions.temperature, conditions.wind_speed)
    }

    /// Maximum expected production between now and dusk
    pub async fn max_available_power(&self) -> f64 {
        let curve = self.curve().await;
        let now_index = curve.minute_index(self.clock.now()).unwrap_or(0);
        curve.samples[now_index..]
            .iter()
            .fold(0.0_f64, |max, &p| max.max(p))
    }

    /// Smallest-start, latest-end interval today with production ≥ `power`.
    ///
    /// Returns `(now, now)` when no remaining instant of the day qualifies;
    /// callers treat a zero-length window as "no window".
    pub async fn next_power_window(
        &self,
        power: f64,
    ) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
        let curve = self.curve().await;
        let now = self.clock.now();
        let qualifies = |p: f64| p > 0.0 && p >= power;
        let first = curve.samples.iter().position(|&p| qualifies(p));
        let last = curve.samples.iter().rposition(|&p| qualifies(p));
        let (first, last) = match (first, last) {
            (Some(f), Some(l)) => (f, l),
            _ => return (now, now),
        };
        let end = curve.time_at(last);
        if now > end {
            return (now, now);
        }
        let start = curve.time_at(first).max(now);
        (start, end)
    }

    /// Instant of peak expected production today
    pub async fn optimal_time(&self) -> DateTime<FixedOffset> {
        let curve = self.curve().await;
        let best = curve
            .samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0);
        curve.time_at(best)
    }

    /// Today's dawn and dusk; zero-length at midnight when the array never
    /// produces (degenerate winter/config case)
    pub async fn daytime(&self) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
        let curve = self.curve().await;
        match curve.daytime() {
            Some((dawn, dusk)) => (curve.time_at(dawn), curve.time_at(dusk)),
            None => (curve.start, curve.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PvConfig;
    use crate::domain::ManualClock;
    use crate::sensor::StaticWeather;
    use chrono::{TimeZone, Timelike};

    fn phoenix(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 21, hour, minute, 0)
            .unwrap()
    }

    fn predictor(at: DateTime<FixedOffset>) -> PvPredictor {
        let cfg = PvConfig {
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
        PvPredictor::new(
            PvArray::new(&cfg),
            Arc::new(StaticWeather::new(95.0, 5.0)),
            Arc::new(ManualClock::new(at)),
            cfg.forecast_epsilon,
        )
    }

    #[tokio::test]
    async fn test_daytime_brackets_noon() {
        let p = predictor(phoenix(10, 0));
        let (dawn, dusk) = p.daytime().await;
        assert!(dawn.hour() < 9);
        assert!(dusk.hour() > 15);
        assert!(dawn < dusk);
    }

    #[tokio::test]
    async fn test_optimal_time_is_midday() {
        let p = predictor(phoenix(10, 0));
        let optimal = p.optimal_time().await;
        assert!((10..15).contains(&optimal.hour()), "{optimal}");
    }

    #[tokio::test]
    async fn test_window_contains_noon_for_modest_power() {
        let p = predictor(phoenix(8, 0));
        let (start, end) = p.next_power_window(2.0).await;
        assert!(start < end);
        assert!(start <= phoenix(12, 0) && phoenix(12, 0) <= end);
    }

    #[tokio::test]
    async fn test_window_start_is_now_when_already_producing() {
        let p = predictor(phoenix(12, 0));
        let (start, end) = p.next_power_window(2.0).await;
        assert_eq!(start, phoenix(12, 0));
        assert!(end > start);
    }

    #[tokio::test]
    async fn test_unreachable_power_gives_zero_length_window() {
        let p = predictor(phoenix(12, 0));
        let (start, end) = p.next_power_window(100.0).await;
        assert_eq!(start, end);
    }

    #[tokio::test]
    async fn test_window_after_dusk_is_zero_length() {
        let p = predictor(phoenix(23, 30));
        let (start, end) = p.next_power_window(2.0).await;
        assert_eq!(start, end);
    }

    #[tokio::test]
    async fn test_max_available_power_declines_through_the_day() {
        let morning = predictor(phoenix(8, 0)).max_available_power().await;
        let evening = predictor(phoenix(17, 30)).max_available_power().await;
        assert!(morning > evening);
        assert!(evening >= 0.0);
    }

    #[tokio::test]
    async fn test_power_at_night_is_zero() {
        let p = predictor(phoenix(12, 0));
        assert_eq!(p.power_at(phoenix(2, 0), None, None).await, 0.0);
    }

    #[tokio::test]
    async fn test_supplied_weather_overrides_forecast() {
        let p = predictor(phoenix(12, 0));
        let hot = p.power_at(phoenix(12, 30), Some(115.0), Some(0.0)).await;
        let cool = p.power_at(phoenix(12, 30), Some(55.0), Some(10.0)).await;
        assert!(cool > hot);
    }

    #[tokio::test]
    async fn test_degraded_when_weather_is_down() {
        let cfg_clock = Arc::new(ManualClock::new(phoenix(12, 0)));
        let p = predictor(phoenix(12, 0));
        // SeasonalWeather::current always fails, conditions_at succeeds, so
        // wire a predictor whose service fails outright.
        struct DeadWeather;
        #[async_trait::async_trait]
        impl WeatherService for DeadWeather {
            async fn current(&self) -> Result<WeatherConditions, crate::domain::AdapterError> {
                Err(crate::domain::AdapterError::Timeout)
            }
            async fn conditions_at(
                &self,
                _at: DateTime<FixedOffset>,
            ) -> Result<WeatherConditions, crate::domain::AdapterError> {
                Err(crate::domain::AdapterError::Timeout)
            }
            async fn minimum_temperature(
                &self,
                _hours: u32,
            ) -> Result<f64, crate::domain::AdapterError> {
                Err(crate::domain::AdapterError::Timeout)
            }
            async fn maximum_temperature(
                &self,
                _hours: u32,
            ) -> Result<f64, crate::domain::AdapterError> {
                Err(crate::domain::AdapterError::Timeout)
            }
        }
        let dead = PvPredictor::new(
            PvArray::new(&PvConfig {
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
            }),
            Arc::new(DeadWeather),
            cfg_clock,
            2.0,
        );
        assert!(!p.is_degraded());
        let noon = dead.power_at(phoenix(12, 30), None, None).await;
        assert!(noon > 0.0, "seasonal fallback still predicts production");
        assert!(dead.is_degraded());
    }
}
