//! Sparse detector grid.
//!
//! Instead of simulating every detector, a rows x columns lattice spanning
//! the latitude and longitude of the real detectors is simulated on a reduced
//! wavelength grid. Each real spectrum is then filled in by bilinear
//! interpolation across the lattice followed by interpolation along the
//! wavelength axis.
//!
//! Positions are located by the latitude and longitude of
//! [`crate::instrument::angles`].

use anyhow::{bail, ensure, Result};
use itertools::Itertools;
use nalgebra::Point3;
use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};

use crate::instrument::{angles, position};
use crate::interpolation::{Extrapolation, Interpolation};
use crate::strategy::AttenuationEstimate;

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> Vec<Point3<f64>> {
        let mut positions = Vec::new();
        for lat in [-10.0_f64, 0.0, 10.0] {
            for long in [20.0_f64, 60.0, 100.0, 140.0] {
                positions.push(position(lat.to_radians(), long.to_radians(), 2.0));
            }
        }
        positions
    }

    fn grid() -> SparseGrid {
        let settings = SparseSettings {
            rows: 3,
            columns: 4,
            wavelength_points: 2,
        };
        SparseGrid::new(&settings, &bank(), 1.0, 5.0, 1).unwrap()
    }

    #[test]
    fn angles_round_trip() {
        let p = position(0.3, -1.2, 4.0);
        let (lat, long) = angles(&p);
        assert!((lat - 0.3).abs() < 1e-12 && (long + 1.2).abs() < 1e-12);
        let (lat, long) = angles(&Point3::new(0.0, 0.0, 1.0));
        assert_eq!((lat, long), (0.0, 0.0));
    }

    #[test]
    fn grid_spans_detectors() {
        let grid = grid();
        assert_eq!(grid.node_positions().len(), 12);
        assert!((grid.distance - 2.0).abs() < 1e-12);
        assert_eq!(grid.wavelengths, vec![1.0, 5.0]);
    }

    #[test]
    fn exact_at_nodes_and_bounded_between() {
        let mut grid = grid();
        let nodes = grid.node_positions();
        for (i, node) in nodes.iter().enumerate() {
            let (lat, long) = angles(node);
            let value = 0.1 * i as f64 + lat + long;
            grid.set_node(0, i, &[
                AttenuationEstimate { value, error: 0.01 },
                AttenuationEstimate { value: 2.0 * value, error: 0.02 },
            ]);
        }
        for (i, node) in nodes.iter().enumerate() {
            let (lat, long) = angles(node);
            let at = grid.interpolate_from_detector_grid(0, lat, long);
            let expected = 0.1 * i as f64 + lat + long;
            assert!((at[0].value - expected).abs() < 1e-12, "{} vs {}", at[0].value, expected);
        }
        // between the first two nodes of the first row
        let (lat0, long0) = angles(&nodes[0]);
        let (_, long1) = angles(&nodes[1]);
        let mid = grid.interpolate_from_detector_grid(0, lat0, 0.5 * (long0 + long1));
        let a = grid.interpolate_from_detector_grid(0, lat0, long0)[0].value;
        let b = grid.interpolate_from_detector_grid(0, lat0, long1)[0].value;
        assert!(mid[0].value >= a.min(b) && mid[0].value <= a.max(b));
    }

    #[test]
    fn too_few_wavelength_points_are_rejected() {
        let settings = |wavelength_points| SparseSettings {
            rows: 2,
            columns: 2,
            wavelength_points,
        };
        assert!(settings(1).validate(Interpolation::Linear).is_err());
        assert!(settings(2).validate(Interpolation::Linear).is_ok());
        assert!(settings(2).validate(Interpolation::CSpline).is_err());
        assert!(settings(3).validate(Interpolation::CSpline).is_ok());
        assert!(settings(1).validate(Interpolation::None).is_ok());
    }

    #[test]
    fn outside_positions_clamp_to_edge() {
        let mut grid = grid();
        for i in 0..12 {
            grid.set_node(0, i, &[AttenuationEstimate { value: i as f64, error: 0.0 }; 2]);
        }
        let edge = grid.interpolate_from_detector_grid(0, 10.0_f64.to_radians(), 140.0_f64.to_radians());
        let beyond = grid.interpolate_from_detector_grid(0, 1.0, 3.0);
        assert_eq!(edge[0].value, beyond[0].value);
    }

    #[test]
    fn single_row_is_linear_in_longitude() {
        let positions: Vec<_> = [0.0_f64, 90.0]
            .iter()
            .map(|l| position(0.0, l.to_radians(), 1.0))
            .collect();
        let settings = SparseSettings {
            rows: 1,
            columns: 2,
            wavelength_points: 1,
        };
        let mut grid = SparseGrid::new(&settings, &positions, 2.0, 2.0, 1).unwrap();
        grid.set_node(0, 0, &[AttenuationEstimate { value: 1.0, error: 0.0 }]);
        grid.set_node(0, 1, &[AttenuationEstimate { value: 3.0, error: 0.0 }]);
        let mid = grid.interpolate_from_detector_grid(0, 0.2, 45.0_f64.to_radians());
        assert!((mid[0].value - 2.0).abs() < 1e-12);
    }
}

/// Sparse grid shape as read from the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SparseSettings {
    pub rows: usize,
    pub columns: usize,
    pub wavelength_points: usize,
}

impl SparseSettings {
    pub fn validate(&self, interpolation: Interpolation) -> Result<()> {
        ensure!(
            self.rows > 0 && self.columns > 0,
            "sparse grid needs at least one row and one column, got {} x {}",
            self.rows,
            self.columns
        );
        ensure!(
            self.wavelength_points > 0,
            "sparse wavelength_points must be greater than 0"
        );
        interpolation.check_points(self.wavelength_points)?;
        Ok(())
    }
}

/// One axis of the lattice.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Axis {
    min: f64,
    step: f64,
    count: usize,
}

impl Axis {
    fn spanning(min: f64, max: f64, count: usize) -> Self {
        if count == 1 {
            Self {
                min: 0.5 * (min + max),
                step: 0.0,
                count,
            }
        } else {
            Self {
                min,
                step: (max - min) / (count - 1) as f64,
                count,
            }
        }
    }

    fn node(&self, i: usize) -> f64 {
        self.min + i as f64 * self.step
    }

    /// Lower node index and fractional offset towards the next node, clamped
    /// to the lattice.
    fn locate(&self, value: f64) -> (usize, f64) {
        if self.count == 1 || self.step == 0.0 {
            return (0, 0.0);
        }
        let x = ((value - self.min) / self.step).clamp(0.0, (self.count - 1) as f64);
        let i = (x.floor() as usize).min(self.count - 2);
        (i, x - i as f64)
    }
}

/// The simulated lattice and its results.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGrid {
    latitude: Axis,
    longitude: Axis,
    pub distance: f64,
    pub wavelengths: Vec<f64>,
    values: Array3<f64>, // (order, node, wavelength)
    errors: Array3<f64>,
}

impl SparseGrid {
    /// Lays the lattice over `detectors`, at their mean distance, with an
    /// evenly spaced reduced wavelength grid between `min` and `max`.
    pub fn new(
        settings: &SparseSettings,
        detectors: &[Point3<f64>],
        wavelength_min: f64,
        wavelength_max: f64,
        orders: usize,
    ) -> Result<Self> {
        if detectors.is_empty() {
            bail!("sparse grid needs at least one unmasked detector");
        }
        let directions: Vec<(f64, f64)> = detectors.iter().map(angles).collect();
        let (lat_min, lat_max) = bounds(directions.iter().map(|a| a.0));
        let (long_min, long_max) = bounds(directions.iter().map(|a| a.1));
        let distance =
            detectors.iter().map(|p| p.coords.norm()).sum::<f64>() / detectors.len() as f64;

        let wavelengths = if settings.wavelength_points == 1 || wavelength_max == wavelength_min {
            vec![0.5 * (wavelength_min + wavelength_max)]
        } else {
            Array1::linspace(wavelength_min, wavelength_max, settings.wavelength_points).to_vec()
        };
        let nodes = settings.rows * settings.columns;

        Ok(Self {
            latitude: Axis::spanning(lat_min, lat_max, settings.rows),
            longitude: Axis::spanning(long_min, long_max, settings.columns),
            distance,
            values: Array3::zeros((orders, nodes, wavelengths.len())),
            errors: Array3::zeros((orders, nodes, wavelengths.len())),
            wavelengths,
        })
    }

    pub fn rows(&self) -> usize {
        self.latitude.count
    }

    pub fn columns(&self) -> usize {
        self.longitude.count
    }

    /// Lattice positions, row by row.
    pub fn node_positions(&self) -> Vec<Point3<f64>> {
        (0..self.rows())
            .cartesian_product(0..self.columns())
            .map(|(i, j)| position(self.latitude.node(i), self.longitude.node(j), self.distance))
            .collect()
    }

    /// Stores the simulated estimates of one node for one order.
    pub fn set_node(&mut self, order_index: usize, node: usize, estimates: &[AttenuationEstimate]) {
        for (k, estimate) in estimates.iter().enumerate() {
            self.values[[order_index, node, k]] = estimate.value;
            self.errors[[order_index, node, k]] = estimate.error;
        }
    }

    /// Bilinear interpolation at every reduced wavelength. Positions outside
    /// the lattice take the value at its edge.
    pub fn interpolate_from_detector_grid(
        &self,
        order_index: usize,
        latitude: f64,
        longitude: f64,
    ) -> Vec<AttenuationEstimate> {
        let (i, t) = self.latitude.locate(latitude);
        let (j, u) = self.longitude.locate(longitude);
        let i1 = (i + 1).min(self.rows() - 1);
        let j1 = (j + 1).min(self.columns() - 1);
        let corners = [
            (i * self.columns() + j, (1.0 - t) * (1.0 - u)),
            (i * self.columns() + j1, (1.0 - t) * u),
            (i1 * self.columns() + j, t * (1.0 - u)),
            (i1 * self.columns() + j1, t * u),
        ];
        (0..self.wavelengths.len())
            .map(|k| {
                let mix = |data: &Array3<f64>| {
                    corners
                        .iter()
                        .filter(|(_, w)| *w != 0.0)
                        .map(|&(node, w)| w * data[[order_index, node, k]])
                        .sum::<f64>()
                };
                AttenuationEstimate {
                    value: mix(&self.values),
                    error: mix(&self.errors),
                }
            })
            .collect()
    }

    /// Estimates for a real detector along its full wavelength axis.
    pub fn spectrum(
        &self,
        order_index: usize,
        detector: &Point3<f64>,
        wavelengths: &[f64],
        interpolation: Interpolation,
        extrapolation: Extrapolation,
    ) -> Result<Vec<AttenuationEstimate>> {
        let (latitude, longitude) = angles(detector);
        let reduced = self.interpolate_from_detector_grid(order_index, latitude, longitude);
        let values: Vec<f64> = reduced.iter().map(|e| e.value).collect();
        let errors: Vec<f64> = reduced.iter().map(|e| e.error).collect();
        let kind = match interpolation {
            Interpolation::None => Interpolation::Linear,
            other => other,
        };
        let values = kind.interpolate(&self.wavelengths, &values, wavelengths, extrapolation)?;
        let errors = kind.interpolate(&self.wavelengths, &errors, wavelengths, extrapolation)?;
        Ok(values
            .into_iter()
            .zip(errors)
            .map(|(value, error)| AttenuationEstimate { value, error })
            .collect())
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}
