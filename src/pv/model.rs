use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike};
use std::f64::consts::PI;

use crate::config::PvConfig;

const SOLAR_CONSTANT: f64 = 1367.0; // W/m²

// Faiman cell-temperature coefficients for open-rack glass/glass modules
const FAIMAN_U0: f64 = 25.0;
const FAIMAN_U1: f64 = 6.84;

pub fn celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

pub fn meters_per_second(mph: f64) -> f64 {
    mph / 2.237
}

/// Clear-sky production model for a fixed-mount PV array.
///
/// Combines solar position, a Kasten-Young clear-sky transmittance, the
/// plane-of-array incidence of the panel geometry, cell-temperature derating
/// from air temperature and wind, age degradation and inverter clipping.
#[derive(Debug, Clone)]
pub struct PvArray {
    latitude: f64,
    longitude: f64,
    tilt_rad: f64,
    azimuth_rad: f64,
    nameplate_kw: f64,
    temperature_coefficient: f64,
    inverter_peak_kw: f64,
    installation_date: Option<NaiveDate>,
    first_year_degradation: f64,
    other_year_degradation: f64,
}

impl PvArray {
    pub fn new(cfg: &PvConfig) -> Self {
        let nameplate_kw =
            cfg.module_power_w * cfg.modules_per_string as f64 * cfg.strings as f64 / 1000.0;
        Self {
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            tilt_rad: cfg.tilt.to_radians(),
            azimuth_rad: cfg.azimuth.to_radians(),
            nameplate_kw,
            temperature_coefficient: cfg.temperature_coefficient,
            inverter_peak_kw: cfg.inverter_peak_kw,
            installation_date: cfg.installation_date,
            first_year_degradation: cfg.first_year_degradation,
            other_year_degradation: cfg.other_year_degradation,
        }
    }

    /// Solar elevation and azimuth in degrees at `time`.
    ///
    /// Azimuth is measured from north, east positive; elevation 0 is the
    /// horizon.
    pub fn solar_position(&self, time: DateTime<FixedOffset>) -> (f64, f64) {
        let day_of_year = time.ordinal() as f64;
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0;
        let utc_offset_hours = time.offset().local_minus_utc() as f64 / 3600.0;

        let declination_deg = 23.45 * (360.0 / 365.0 * (day_of_year + 284.0) * PI / 180.0).sin();
        let declination_rad = declination_deg.to_radians();
        let latitude_rad = self.latitude.to_radians();

        let solar_time = hour + self.longitude / 15.0 - utc_offset_hours;
        let hour_angle_deg = 15.0 * (solar_time - 12.0);
        let hour_angle_rad = hour_angle_deg.to_radians();

        let elevation_sin = latitude_rad.sin() * declination_rad.sin()
            + latitude_rad.cos() * declination_rad.cos() * hour_angle_rad.cos();
        let elevation_rad = elevation_sin.asin();
        let elevation_deg = elevation_rad.to_degrees();

        let azimuth_cos = (declination_rad.sin() - latitude_rad.sin() * elevation_rad.sin())
            / (latitude_rad.cos() * elevation_rad.cos());
        let mut azimuth_deg = azimuth_cos.clamp(-1.0, 1.0).acos().to_degrees();
        if hour_angle_deg > 0.0 {
            azimuth_deg = 360.0 - azimuth_deg;
        }

        (elevation_deg, azimuth_deg)
    }

    /// Clear-sky direct-normal irradiance in W/m²
    fn beam_irradiance(&self, elevation_deg: f64) -> f64 {
        if elevation_deg <= 0.0 {
            return 0.0;
        }
        let elevation_rad = elevation_deg.to_radians();
        let air_mass = if elevation_deg > 5.0 {
            1.0 / elevation_rad.sin()
        } else {
            12.0 - elevation_deg / 5.0
        };
        let transmittance = 0.7_f64.powf(air_mass.powf(0.678));
        SOLAR_CONSTANT * transmittance
    }

    /// Irradiance on the panel plane in W/m²
    pub fn plane_of_array_irradiance(&self, time: DateTime<FixedOffset>) -> f64 {
        let (elevation_deg, azimuth_deg) = self.solar_position(time);
        if elevation_deg <= 0.0 {
            return 0.0;
        }
        let elevation_rad = elevation_deg.to_radians();
        let azimuth_rad = azimuth_deg.to_radians();
        let cos_aoi = elevation_rad.sin() * self.tilt_rad.cos()
            + elevation_rad.cos() * self.tilt_rad.sin() * (azimuth_rad - self.azimuth_rad).cos();
        self.beam_irradiance(elevation_deg) * cos_aoi.max(0.0)
    }

    /// Nameplate power derated by array age
    fn degraded_nameplate_kw(&self, on: NaiveDate) -> f64 {
        let installed = match self.installation_date {
            Some(date) => date,
            None => return self.nameplate_kw,
        };
        let years = (on - installed).num_days() as f64 / 365.2422;
        if years <= 0.0 {
            return self.nameplate_kw;
        }
        let percent = if years <= 1.0 {
            100.0 - years * self.first_year_degradation
        } else {
            100.0 - self.first_year_degradation - self.other_year_degradation * (years - 1.0)
        };
        self.nameplate_kw * percent.max(0.0) / 100.0
    }

    /// AC production in kW at `time` under clear sky and the given weather
    pub fn power_at(
        &self,
        time: DateTime<FixedOffset>,
        temp_air_f: f64,
        wind_speed_mph: f64,
    ) -> f64 {
        let poa = self.plane_of_array_irradiance(time);
        if poa <= 0.0 {
            return 0.0;
        }
        let wind = meters_per_second(wind_speed_mph);
        let cell_temp = celsius(temp_air_f) + poa / (FAIMAN_U0 + FAIMAN_U1 * wind);
        let pdc0 = self.degraded_nameplate_kw(time.date_naive());
        let dc = pdc0 * (poa / 1000.0) * (1.0 + self.temperature_coefficient * (cell_temp - 25.0));
        dc.max(0.0).min(self.inverter_peak_kw)
    }
}
