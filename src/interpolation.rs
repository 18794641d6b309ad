//! Filling in wavelength points that were not simulated.
//!
//! A spectrum is simulated at a reduced, evenly spaced subset of its
//! wavelengths that always includes the first and last point; the remaining
//! points are interpolated. Queries outside the simulated range follow the
//! extrapolation policy instead of failing.

use anyhow::{ensure, Result};
use ndarray::Array1;
use ndarray_interp::interp1d::cubic_spline::CubicSpline;
use ndarray_interp::interp1d::{Interp1DBuilder, Linear};
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_include_both_ends() {
        assert_eq!(simulated_indices(10, 3), vec![0, 5, 9]);
        assert_eq!(simulated_indices(10, 10), (0..10).collect::<Vec<_>>());
        assert_eq!(simulated_indices(5, 2), vec![0, 4]);
        assert_eq!(simulated_indices(1, 1), vec![0]);
    }

    #[test]
    fn minimum_points_per_kind() {
        assert!(Interpolation::Linear.check_points(1).is_err());
        assert!(Interpolation::Linear.check_points(2).is_ok());
        assert!(Interpolation::CSpline.check_points(2).is_err());
        assert!(Interpolation::CSpline.check_points(3).is_ok());
    }

    #[test]
    fn linear_is_exact_on_lines() {
        let x = [1.0, 2.0, 4.0];
        let y = [2.0, 4.0, 8.0];
        let out = Interpolation::Linear
            .interpolate(&x, &y, &[1.0, 1.5, 3.0, 4.0], Extrapolation::Flat)
            .unwrap();
        for (a, b) in out.iter().zip([2.0, 3.0, 6.0, 8.0]) {
            assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
        }
    }

    #[test]
    fn spline_passes_through_nodes() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 0.5, 0.4, 0.2];
        let out = Interpolation::CSpline
            .interpolate(&x, &y, &x, Extrapolation::Flat)
            .unwrap();
        for (a, b) in out.iter().zip(y.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn extrapolation_policies() {
        let x = [1.0, 2.0];
        let y = [0.5, 0.25];
        let flat = Interpolation::Linear
            .interpolate(&x, &y, &[0.5, 8.0], Extrapolation::Flat)
            .unwrap();
        assert_eq!(flat, vec![0.5, 0.25]);
        let root = Interpolation::Linear
            .interpolate(&x, &y, &[0.25, 8.0], Extrapolation::SquareRoot)
            .unwrap();
        assert!((root[0] - 0.25).abs() < 1e-12);
        assert!((root[1] - 0.5).abs() < 1e-12);
    }
}

/// How unsimulated wavelength points are filled in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    None, // every wavelength is simulated
    #[default]
    Linear,
    #[value(name = "cspline")]
    CSpline,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpolation::None => write!(f, "none"),
            Interpolation::Linear => write!(f, "linear"),
            Interpolation::CSpline => write!(f, "cspline"),
        }
    }
}

/// What a query outside the simulated wavelength range returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Extrapolation {
    #[default]
    Flat, // hold the nearest simulated value
    SquareRoot, // nearest value times sqrt(lambda / lambda_edge)
}

impl Extrapolation {
    fn apply(&self, edge_value: f64, edge_wavelength: f64, wavelength: f64) -> f64 {
        match self {
            Extrapolation::Flat => edge_value,
            Extrapolation::SquareRoot => edge_value * (wavelength / edge_wavelength).sqrt(),
        }
    }
}

impl Interpolation {
    pub fn min_points(&self) -> usize {
        match self {
            Interpolation::None => 1,
            Interpolation::Linear => 2,
            Interpolation::CSpline => 3,
        }
    }

    pub fn check_points(&self, points: usize) -> Result<()> {
        ensure!(
            points >= self.min_points(),
            "wavelength_points: {} interpolation needs at least {} points, got {}",
            self,
            self.min_points(),
            points
        );
        Ok(())
    }

    /// Evaluates the curve through (`x`, `y`) at every query. `x` must be
    /// strictly increasing. A single point is held flat.
    pub fn interpolate(
        &self,
        x: &[f64],
        y: &[f64],
        queries: &[f64],
        extrapolation: Extrapolation,
    ) -> Result<Vec<f64>> {
        ensure!(
            x.len() == y.len() && !x.is_empty(),
            "interpolation needs matching, non-empty node arrays ({} vs {})",
            x.len(),
            y.len()
        );
        let first = 0;
        let last = x.len() - 1;

        let kind = if x.len() < self.min_points() || x.len() == 1 {
            Interpolation::None
        } else {
            *self
        };
        // the curve only sees queries inside the node range
        let inside: Vec<f64> = queries
            .iter()
            .map(|q| q.clamp(x[first], x[last]))
            .collect();
        let values: Vec<f64> = match kind {
            Interpolation::None => inside.iter().map(|&q| nearest(x, y, q)).collect(),
            Interpolation::Linear => {
                let curve = Interp1DBuilder::new(Array1::from(y.to_vec()))
                    .x(Array1::from(x.to_vec()))
                    .strategy(Linear::new())
                    .build()?;
                inside
                    .iter()
                    .map(|&q| curve.interp_scalar(q))
                    .collect::<Result<_, _>>()?
            }
            Interpolation::CSpline => {
                let curve = Interp1DBuilder::new(Array1::from(y.to_vec()))
                    .x(Array1::from(x.to_vec()))
                    .strategy(CubicSpline::new())
                    .build()?;
                inside
                    .iter()
                    .map(|&q| curve.interp_scalar(q))
                    .collect::<Result<_, _>>()?
            }
        };

        Ok(queries
            .iter()
            .zip(values)
            .map(|(&q, value)| {
                if q < x[first] {
                    extrapolation.apply(y[first], x[first], q)
                } else if q > x[last] {
                    extrapolation.apply(y[last], x[last], q)
                } else {
                    value
                }
            })
            .collect())
    }
}

fn nearest(x: &[f64], y: &[f64], q: f64) -> f64 {
    let i = x
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - q).abs().total_cmp(&(b.1 - q).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    y[i]
}

/// Evenly spaced indices into `total` points, always including the first and last.
pub fn simulated_indices(total: usize, points: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    if points <= 1 || total == 1 {
        return vec![0];
    }
    let points = points.min(total);
    let mut indices: Vec<usize> = (0..points)
        .map(|i| ((i * (total - 1)) as f64 / (points - 1) as f64).round() as usize)
        .collect();
    indices.dedup();
    indices
}
