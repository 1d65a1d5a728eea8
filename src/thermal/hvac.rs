use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::store::Store;

pub const HVAC_MODEL_KEY: &str = "hvac_model";

/// Bézier curve over fitted (x, y) nodes, evaluated by de Casteljau.
///
/// The parameter is mapped linearly between the first and last node x; the
/// fitted ranges are narrow enough that the approximation holds. Queries
/// outside the range return the endpoint value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveTable {
    pub nodes: Vec<[f64; 2]>,
}

impl CurveTable {
    pub fn new(nodes: Vec<[f64; 2]>) -> Result<Self> {
        ensure!(nodes.len() >= 2, "curve needs at least two nodes");
        ensure!(
            nodes.windows(2).all(|w| w[0][0] < w[1][0]),
            "curve nodes must have strictly increasing x"
        );
        Ok(Self { nodes })
    }

    fn parameter(&self, x: f64) -> f64 {
        let first = self.nodes[0][0];
        let last = self.nodes[self.nodes.len() - 1][0];
        (x - first) / (last - first)
    }

    /// Curve y value at `x`, clamped outside the node range
    pub fn evaluate(&self, x: f64) -> f64 {
        if x <= self.nodes[0][0] {
            return self.nodes[0][1];
        }
        if x >= self.nodes[self.nodes.len() - 1][0] {
            return self.nodes[self.nodes.len() - 1][1];
        }
        let t = self.parameter(x);
        let mut points = self.nodes.clone();
        for step in (1..points.len()).rev() {
            for i in 0..step {
                points[i][0] = points[i][0] + (points[i + 1][0] - points[i][0]) * t;
                points[i][1] = points[i][1] + (points[i + 1][1] - points[i][1]) * t;
            }
        }
        points[0][1]
    }
}

/// HVAC power draw and heating/cooling rate as a function of outdoor
/// temperature, smoothed over empirically fitted nodes.
///
/// Rebuilt offline from collected statistics; the node tables live in the
/// key/value store and can be hot-swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvacModel {
    power_curve: CurveTable,
    time_curve: CurveTable,
}

impl HvacModel {
    pub fn new(power_nodes: Vec<[f64; 2]>, time_nodes: Vec<[f64; 2]>) -> Result<Self> {
        Ok(Self {
            power_curve: CurveTable::new(power_nodes)?,
            time_curve: CurveTable::new(time_nodes)?,
        })
    }

    /// Load the fitted tables from the store, defaulting to the built-in fit
    pub fn load(store: &Store) -> Self {
        store
            .get::<HvacModel>(HVAC_MODEL_KEY)
            .unwrap_or_else(Self::default)
    }

    /// Power in kW drawn while running at `outdoor_temp` °F
    pub fn power(&self, outdoor_temp: f64) -> f64 {
        self.power_curve.evaluate(outdoor_temp)
    }

    /// Minutes needed to move the indoor temperature by one °F
    pub fn minutes_per_degree(&self, outdoor_temp: f64) -> f64 {
        self.time_curve.evaluate(outdoor_temp)
    }
}

impl Default for HvacModel {
    fn default() -> Self {
        // Fit from a cooling season of (outdoor °F, kW) and (outdoor °F,
        // min/°F) statistics
        Self::new(
            vec![
                [55.0, 3.1],
                [70.0, 3.6],
                [85.0, 4.3],
                [95.0, 4.9],
                [105.0, 5.5],
                [115.0, 6.0],
            ],
            vec![
                [55.0, 7.0],
                [70.0, 9.0],
                [85.0, 13.0],
                [95.0, 18.0],
                [105.0, 27.0],
                [115.0, 40.0],
            ],
        )
        .expect("built-in model tables are well-formed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_rejects_bad_nodes() {
        assert!(CurveTable::new(vec![[0.0, 1.0]]).is_err());
        assert!(CurveTable::new(vec![[1.0, 1.0], [1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_curve_hits_endpoints() {
        let curve = CurveTable::new(vec![[0.0, 1.0], [10.0, 5.0]]).unwrap();
        assert_eq!(curve.evaluate(0.0), 1.0);
        assert_eq!(curve.evaluate(10.0), 5.0);
    }

    #[test]
    fn test_curve_clamps_outside_range() {
        let curve = CurveTable::new(vec![[50.0, 3.0], [100.0, 6.0]]).unwrap();
        assert_eq!(curve.evaluate(30.0), 3.0);
        assert_eq!(curve.evaluate(130.0), 6.0);
    }

    #[test]
    fn test_linear_curve_interpolates_linearly() {
        let curve = CurveTable::new(vec![[0.0, 0.0], [10.0, 10.0]]).unwrap();
        assert!((curve.evaluate(5.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_hvac_power_rises_with_heat() {
        let model = HvacModel::default();
        assert!(model.power(105.0) > model.power(75.0));
        assert!(model.power(75.0) > 0.0);
    }

    #[test]
    fn test_cooling_slows_down_in_heat() {
        let model = HvacModel::default();
        assert!(model.minutes_per_degree(110.0) > model.minutes_per_degree(70.0));
    }

    #[test]
    fn test_model_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("storage.json")).unwrap();
        let model = HvacModel::new(vec![[60.0, 3.0], [100.0, 5.0]], vec![[60.0, 8.0], [100.0, 20.0]])
            .unwrap();
        store.put(HVAC_MODEL_KEY, &model).unwrap();

        let loaded = HvacModel::load(&store);
        assert_eq!(loaded.power(50.0), 3.0);
        assert_eq!(loaded.minutes_per_degree(110.0), 20.0);
    }

    #[test]
    fn test_load_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("storage.json")).unwrap();
        let model = HvacModel::load(&store);
        assert!(model.power(95.0) > 4.0);
    }
}
