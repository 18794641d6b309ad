//! Detector positions and the wavelength axis shared by every spectrum.
//!
//! Detector angles use the beam frame: latitude is the elevation out of the
//! horizontal xz plane and longitude the azimuth about y, measured from the
//! beam direction (+z) towards +x.

use anyhow::{bail, ensure, Result};
use itertools::Itertools;
use nalgebra::Point3;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_spans_its_angles() {
        let layout = DetectorLayout::Bank {
            rows: 2,
            columns: 3,
            distance: 2.0,
            latitude: [-10.0, 10.0],
            longitude: [0.0, 90.0],
            masked: vec![4],
        };
        layout.validate().unwrap();
        let positions = layout.positions();
        assert_eq!(positions.len(), 6);
        assert!(positions.iter().all(|p| (p.coords.norm() - 2.0).abs() < 1e-12));
        // row-major: first row at the lowest latitude
        let (lat, long) = angles(&positions[0]);
        assert!((lat.to_degrees() + 10.0).abs() < 1e-9 && long.abs() < 1e-9);
        let (_, long) = angles(&positions[2]);
        assert!((long.to_degrees() - 90.0).abs() < 1e-9);
        assert!(layout.is_masked(4) && !layout.is_masked(3));
    }

    #[test]
    fn masked_index_out_of_range_is_rejected() {
        let layout = DetectorLayout::Custom {
            positions: vec![Point3::new(0.0, 0.0, 1.0)],
            masked: vec![1],
        };
        let err = layout.validate().unwrap_err().to_string();
        assert!(err.contains("masked"), "{}", err);
    }

    #[test]
    fn detector_at_sample_is_rejected() {
        let layout = DetectorLayout::Custom {
            positions: vec![Point3::origin()],
            masked: vec![],
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn wavelength_grid_values() {
        let grid = WavelengthGrid {
            min: 0.5,
            max: 9.5,
            num_points: 10,
        };
        grid.validate().unwrap();
        let values = grid.values();
        assert_eq!(values.len(), 10);
        assert_eq!(values[0], 0.5);
        assert!((values[4] - 4.5).abs() < 1e-12);
        assert_eq!(values[9], 9.5);

        let single = WavelengthGrid {
            min: 2.0,
            max: 2.0,
            num_points: 1,
        };
        assert_eq!(single.values(), vec![2.0]);
    }

    #[test]
    fn inverted_wavelength_range_is_rejected() {
        let grid = WavelengthGrid {
            min: 4.0,
            max: 1.0,
            num_points: 5,
        };
        assert!(grid.validate().is_err());
    }
}

/// Latitude and longitude (radians) of a position seen from the sample.
pub fn angles(position: &Point3<f64>) -> (f64, f64) {
    let r = position.coords.norm();
    if r == 0.0 {
        return (0.0, 0.0);
    }
    ((position.y / r).clamp(-1.0, 1.0).asin(), position.x.atan2(position.z))
}

/// Position at `distance` in the direction given by latitude and longitude.
pub fn position(latitude: f64, longitude: f64, distance: f64) -> Point3<f64> {
    Point3::new(
        distance * latitude.cos() * longitude.sin(),
        distance * latitude.sin(),
        distance * latitude.cos() * longitude.cos(),
    )
}

/// Where the spectra are recorded. Each position is one spectrum.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorLayout {
    /// A regular bank of rows (latitude) by columns (longitude) at a fixed
    /// distance. Angles are given in degrees as [first, last].
    Bank {
        rows: usize,
        columns: usize,
        distance: f64,
        latitude: [f64; 2],
        longitude: [f64; 2],
        #[serde(default)]
        masked: Vec<usize>,
    },
    /// Explicit positions in metres.
    Custom {
        positions: Vec<Point3<f64>>,
        #[serde(default)]
        masked: Vec<usize>,
    },
}

impl DetectorLayout {
    pub fn validate(&self) -> Result<()> {
        match self {
            DetectorLayout::Bank {
                rows,
                columns,
                distance,
                latitude,
                longitude,
                ..
            } => {
                ensure!(
                    *rows > 0 && *columns > 0,
                    "detector bank needs at least one row and one column, got {} x {}",
                    rows,
                    columns
                );
                ensure!(
                    *distance > 0.0 && distance.is_finite(),
                    "detector distance must be positive, got {}",
                    distance
                );
                ensure!(
                    latitude.iter().all(|l| (-90.0..=90.0).contains(l)),
                    "detector latitude must lie within [-90, 90] degrees, got {:?}",
                    latitude
                );
                ensure!(
                    longitude.iter().all(|l| (-180.0..=180.0).contains(l)),
                    "detector longitude must lie within [-180, 180] degrees, got {:?}",
                    longitude
                );
            }
            DetectorLayout::Custom { positions, .. } => {
                ensure!(!positions.is_empty(), "detector list is empty");
                if let Some(i) = positions
                    .iter()
                    .position(|p| !(p.coords.norm() > 0.0) || !p.coords.iter().all(|c| c.is_finite()))
                {
                    bail!("detector {} must lie away from the sample at a finite position", i);
                }
            }
        }
        let count = self.len();
        if let Some(&index) = self.masked().iter().find(|&&i| i >= count) {
            bail!(
                "masked detector index {} is out of range for {} detectors",
                index,
                count
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        match self {
            DetectorLayout::Bank { rows, columns, .. } => rows * columns,
            DetectorLayout::Custom { positions, .. } => positions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn masked(&self) -> &[usize] {
        match self {
            DetectorLayout::Bank { masked, .. } | DetectorLayout::Custom { masked, .. } => masked,
        }
    }

    pub fn is_masked(&self, index: usize) -> bool {
        self.masked().contains(&index)
    }

    /// Every detector position, row by row for a bank.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        match self {
            DetectorLayout::Bank {
                rows,
                columns,
                distance,
                latitude,
                longitude,
                ..
            } => {
                let lats = span(latitude, *rows);
                let longs = span(longitude, *columns);
                lats.iter()
                    .cartesian_product(longs.iter())
                    .map(|(lat, long)| position(lat.to_radians(), long.to_radians(), *distance))
                    .collect()
            }
            DetectorLayout::Custom { positions, .. } => positions.clone(),
        }
    }
}

/// `count` evenly spaced values over `range`, or its midpoint for one value.
fn span(range: &[f64; 2], count: usize) -> Array1<f64> {
    if count == 1 {
        Array1::from_elem(1, 0.5 * (range[0] + range[1]))
    } else {
        Array1::linspace(range[0], range[1], count)
    }
}

/// Evenly spaced wavelengths in Angstrom.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct WavelengthGrid {
    pub min: f64,
    pub max: f64,
    pub num_points: usize,
}

impl WavelengthGrid {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_points > 0, "wavelengths.num_points must be greater than 0");
        ensure!(
            self.min > 0.0 && self.min.is_finite() && self.max.is_finite(),
            "wavelengths.min must be a positive wavelength, got {}",
            self.min
        );
        ensure!(
            self.max > self.min || (self.num_points == 1 && self.max == self.min),
            "wavelengths.max ({}) must exceed wavelengths.min ({})",
            self.max,
            self.min
        );
        Ok(())
    }

    pub fn values(&self) -> Vec<f64> {
        if self.num_points == 1 {
            vec![self.min]
        } else {
            Array1::linspace(self.min, self.max, self.num_points).to_vec()
        }
    }
}
