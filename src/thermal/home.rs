use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::store::Store;

pub const HOME_MODEL_KEY: &str = "home_model";

/// Passive indoor temperature drift in °F per minute over a 2-D
/// (indoor, outdoor) grid, bilinearly interpolated with clamped
/// extrapolation. Positive values mean the house is warming.
///
/// Rebuilt offline from collected statistics; the grid lives in the
/// key/value store and can be hot-swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeModel {
    indoor_axis: Vec<f64>,
    outdoor_axis: Vec<f64>,
    /// drift[i][j] for indoor_axis[i], outdoor_axis[j]
    drift: Vec<Vec<f64>>,
}

impl HomeModel {
    pub fn new(indoor_axis: Vec<f64>, outdoor_axis: Vec<f64>, drift: Vec<Vec<f64>>) -> Result<Self> {
        ensure!(
            indoor_axis.len() >= 2 && outdoor_axis.len() >= 2,
            "home model needs at least a 2x2 grid"
        );
        ensure!(
            indoor_axis.windows(2).all(|w| w[0] < w[1])
                && outdoor_axis.windows(2).all(|w| w[0] < w[1]),
            "grid axes must be strictly increasing"
        );
        ensure!(
            drift.len() == indoor_axis.len()
                && drift.iter().all(|row| row.len() == outdoor_axis.len()),
            "drift grid does not match the axes"
        );
        Ok(Self {
            indoor_axis,
            outdoor_axis,
            drift,
        })
    }

    pub fn load(store: &Store) -> Self {
        store
            .get::<HomeModel>(HOME_MODEL_KEY)
            .unwrap_or_else(Self::default)
    }

    fn bracket(axis: &[f64], value: f64) -> (usize, f64) {
        if value <= axis[0] {
            return (0, 0.0);
        }
        if value >= axis[axis.len() - 1] {
            return (axis.len() - 2, 1.0);
        }
        let hi = axis.iter().position(|&a| a > value).unwrap();
        let lo = hi - 1;
        let frac = (value - axis[lo]) / (axis[hi] - axis[lo]);
        (lo, frac)
    }

    /// Drift rate at the given indoor and outdoor temperatures, °F/minute
    pub fn degree_per_minute(&self, indoor_temp: f64, outdoor_temp: f64) -> f64 {
        let (i, fi) = Self::bracket(&self.indoor_axis, indoor_temp);
        let (j, fj) = Self::bracket(&self.outdoor_axis, outdoor_temp);
        let top = self.drift[i][j] + (self.drift[i][j + 1] - self.drift[i][j]) * fj;
        let bottom = self.drift[i + 1][j] + (self.drift[i + 1][j + 1] - self.drift[i + 1][j]) * fj;
        top + (bottom - top) * fi
    }
}

impl Default for HomeModel {
    fn default() -> Self {
        // Fit over six months of minute-resolution indoor/outdoor data.
        // Drift scales with the outdoor-indoor gap; rows are indoor °F.
        let indoor_axis = vec![65.0, 70.0, 75.0, 80.0];
        let outdoor_axis = vec![40.0, 60.0, 80.0, 100.0, 115.0];
        let drift = vec![
            vec![-0.050, -0.012, 0.028, 0.068, 0.096],
            vec![-0.060, -0.022, 0.018, 0.058, 0.086],
            vec![-0.070, -0.032, 0.008, 0.048, 0.076],
            vec![-0.080, -0.042, -0.002, 0.038, 0.066],
        ];
        Self::new(indoor_axis, outdoor_axis, drift).expect("built-in grid is well-formed")
    }
}
