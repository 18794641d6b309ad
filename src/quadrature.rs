//! Deterministic pairwise quadrature for single and double scattering.
//!
//! The scatter region is cut into cubic elements. For every element the
//! in-component path lengths back to the beam entry, to every other element
//! and to a detector are traced once, after which
//!
//!   A1 = 1/N sum_i exp(-mu (L_in,i + L_out,i))
//!   A2 = 1/N sum_i sum_j!=i exp(-mu (L_in,i + L_ij + L_out,j)) mu_s,j dV / (4 pi r_ij^2)
//!
//! where i runs over the N illuminated elements and j over every element of
//! the region. Only elastic, isotropic scattering is handled. Memory and time
//! grow with the square of the element count.
//!
//! Without an explicit `element_size` the edge is chosen so that the region
//! holds about [`DEFAULT_TARGET_ELEMENTS`] elements.

use std::f64::consts::PI;

use anyhow::{bail, ensure, Result};
use log::debug;
use nalgebra::{Point3, Vector3};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::structure_factor::ScatteringDistribution;
use crate::transport::EMode;
use crate::volume::InteractionVolume;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::Convergence;
    use crate::geom::Shape;
    use crate::material::Material;
    use crate::statistics::InteractionStatistics;
    use crate::strategy::MonteCarloStrategy;
    use crate::transport::Transport;
    use crate::volume::{Component, ScatterRegion};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn thin_cylinder(scatter_xs: f64, absorb_xs: f64) -> InteractionVolume {
        let sample = Component::new(
            "sample",
            Shape::Cylinder {
                base: Point3::new(0.0, -0.005, 0.0),
                axis: Vector3::y(),
                radius: 0.003,
                height: 0.01,
            },
            Material::new("V", 0.072, scatter_xs, absorb_xs),
        );
        InteractionVolume::new(vec![sample], None, ScatterRegion::Sample, 1000).unwrap()
    }

    fn settings(element_size: f64) -> QuadratureSettings {
        QuadratureSettings {
            element_size: Some(element_size),
            max_elements: 10_000,
        }
    }

    fn vanadium_rod() -> InteractionVolume {
        let sample = Component::new(
            "sample",
            Shape::Cylinder {
                base: Point3::new(0.0, -0.02, 0.0),
                axis: Vector3::y(),
                radius: 0.006,
                height: 0.04,
            },
            Material::new("V", 0.072, 5.1, 5.08),
        );
        InteractionVolume::new(vec![sample], None, ScatterRegion::Sample, 1000).unwrap()
    }

    #[test]
    fn default_element_size_fits_the_sample() {
        let volume = vanadium_rod();
        let distribution = ScatteringDistribution::isotropic();
        let quadrature = Quadrature::new(
            &volume,
            &distribution,
            EMode::Elastic,
            &QuadratureSettings::default(),
            &[1],
        )
        .unwrap();
        let count = quadrature.element_count();
        assert!(count > DEFAULT_TARGET_ELEMENTS / 2 && count <= default_max_elements(), "{}", count);
    }

    #[test]
    fn pair_rows_are_symmetric() {
        let volume = thin_cylinder(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let quadrature =
            Quadrature::new(&volume, &distribution, EMode::Elastic, &settings(0.002), &[1, 2]).unwrap();
        let n = quadrature.element_count();
        let pairs = quadrature.pairs.as_ref().unwrap();
        assert_eq!(pairs.lengths.nrows(), n * (n - 1) / 2);
        assert_eq!(pairs.distance_squared.len(), n * (n - 1) / 2);
        let (a, b) = (0, n - 1);
        assert_eq!(quadrature.pair_index(a, b), quadrature.pair_index(b, a));
        let separation = quadrature.elements[b].centre - quadrature.elements[a].centre;
        let row = pairs.lengths.row(quadrature.pair_index(a, b));
        assert!((row.sum() - separation.norm()).abs() < 1e-9);
    }

    #[test]
    fn transparent_sample_is_one() {
        let volume = thin_cylinder(0.0, 0.0);
        let distribution = ScatteringDistribution::isotropic();
        let quadrature =
            Quadrature::new(&volume, &distribution, EMode::Elastic, &settings(0.001), &[1]).unwrap();
        let out = quadrature.calculate(&Point3::new(0.0, 0.0, 2.0), &[1.0, 4.0]);
        for estimate in out {
            assert!((estimate.a1 - 1.0).abs() < 1e-12);
            assert_eq!(estimate.a2, None);
        }
    }

    #[test]
    fn single_scattering_agrees_with_monte_carlo() {
        let volume = thin_cylinder(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let detector = Point3::new(2.0, 0.0, 0.0);
        let wavelengths = [2.0];

        let quadrature =
            Quadrature::new(&volume, &distribution, EMode::Elastic, &settings(0.0005), &[1]).unwrap();
        let a1 = quadrature.calculate(&detector, &wavelengths)[0].a1;

        let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
        let strategy =
            MonteCarloStrategy::new(transport, vec![1], true, Convergence::new(20_000, None, None));
        let mut rng = StdRng::seed_from_u64(3);
        let mut stats = InteractionStatistics::new();
        let mc = strategy.calculate(&mut rng, &detector, &wavelengths, &mut stats)[0][0];

        assert!(((a1 - mc.value) / mc.value).abs() < 0.02, "{} vs {:?}", a1, mc);
    }

    #[test]
    fn double_scattering_is_small_and_positive() {
        let volume = thin_cylinder(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let quadrature =
            Quadrature::new(&volume, &distribution, EMode::Elastic, &settings(0.001), &[1, 2]).unwrap();
        let out = quadrature.calculate(&Point3::new(0.0, 0.0, 2.0), &[1.0]);
        let a2 = out[0].a2.unwrap();
        assert!(a2 > 0.0 && a2 < out[0].a1, "{:?}", out[0]);
    }

    #[test]
    fn element_limit_is_a_configuration_error() {
        let volume = thin_cylinder(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let tight = QuadratureSettings {
            element_size: Some(0.0005),
            max_elements: 10,
        };
        let err = Quadrature::new(&volume, &distribution, EMode::Elastic, &tight, &[1])
            .unwrap_err()
            .to_string();
        assert!(err.contains("max_elements"), "{}", err);
    }

    #[test]
    fn inelastic_is_rejected() {
        let volume = thin_cylinder(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        assert!(Quadrature::new(&volume, &distribution, EMode::Direct, &settings(0.001), &[1]).is_err());
    }
}

/// Element count aimed for when `element_size` is not given.
pub const DEFAULT_TARGET_ELEMENTS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct QuadratureSettings {
    #[serde(default)]
    pub element_size: Option<f64>, // edge of a cubic element, metres; scaled to the region when unset
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

fn default_max_elements() -> usize {
    4000
}

impl Default for QuadratureSettings {
    fn default() -> Self {
        Self {
            element_size: None,
            max_elements: default_max_elements(),
        }
    }
}

impl QuadratureSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.element_size {
            ensure!(
                size > 0.0 && size.is_finite(),
                "quadrature.element_size must be positive, got {}",
                size
            );
        }
        ensure!(
            self.max_elements > 0,
            "quadrature.max_elements must be greater than 0"
        );
        Ok(())
    }
}

/// Single and double scattering factors at one wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuadratureEstimate {
    pub a1: f64,
    pub a2: Option<f64>, // only when order 2 was requested
}

#[derive(Debug, Clone, PartialEq)]
struct Element {
    centre: Point3<f64>,
    component: usize,
    illuminated: bool,
    incoming: Vec<f64>, // per component path length back to the beam entry
}

#[derive(Debug, Clone)]
pub struct Quadrature<'a> {
    volume: &'a InteractionVolume,
    elements: Vec<Element>,
    element_volume: f64,
    pairs: Option<Pairs>,
}

/// Element pairs i < j, packed row by row.
#[derive(Debug, Clone, PartialEq)]
struct Pairs {
    lengths: Array2<f64>, // (pair, component) path length between the centres
    distance_squared: Vec<f64>,
}

impl<'a> Quadrature<'a> {
    /// Discretises the scatter region and traces the detector independent
    /// path lengths. Fails for inelastic modes, tabulated structure factors,
    /// orders above two and element counts above `max_elements`.
    pub fn new(
        volume: &'a InteractionVolume,
        distribution: &ScatteringDistribution,
        emode: EMode,
        settings: &QuadratureSettings,
        orders: &[usize],
    ) -> Result<Self> {
        settings.validate()?;
        if emode != EMode::Elastic {
            bail!("method 'quadrature' only supports emode 'elastic', got '{}'", emode);
        }
        if !distribution.is_isotropic() {
            bail!("method 'quadrature' only supports isotropic scattering; remove [structure_factor]");
        }
        if let Some(order) = orders.iter().find(|&&o| o == 0 || o > 2) {
            bail!("method 'quadrature' covers scattering orders 1 and 2, got {}", order);
        }

        let element_size = settings.element_size.unwrap_or_else(|| {
            (volume.region_volume() / DEFAULT_TARGET_ELEMENTS as f64).cbrt()
        });
        let centres = element_centres(volume, element_size, settings.max_elements)?;
        let elements: Vec<Element> = centres
            .into_iter()
            .map(|(centre, component)| Element {
                incoming: component_lengths(volume, &centre, &-volume.beam.direction(), f64::INFINITY),
                illuminated: volume.beam.illuminates(&centre),
                centre,
                component,
            })
            .collect();
        ensure!(
            elements.iter().any(|e| e.illuminated),
            "no quadrature element is illuminated by the beam; reduce quadrature.element_size"
        );
        let element_volume = volume.region_volume() / elements.len() as f64;

        let pairs = orders.contains(&2).then(|| {
            let n = elements.len();
            let count = n * n.saturating_sub(1) / 2;
            let mut lengths = Array2::zeros((count, volume.components.len()));
            let mut distance_squared = Vec::with_capacity(count);
            let mut row = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    let separation = elements[j].centre - elements[i].centre;
                    let distance = separation.norm();
                    let along = component_lengths(
                        volume,
                        &elements[i].centre,
                        &(separation / distance),
                        distance,
                    );
                    for (cell, length) in lengths.row_mut(row).iter_mut().zip(along) {
                        *cell = length;
                    }
                    distance_squared.push(distance * distance);
                    row += 1;
                }
            }
            Pairs {
                lengths,
                distance_squared,
            }
        });

        debug!(
            "quadrature over {} elements ({} illuminated) of {:.3e} m^3, edge {:.3e} m",
            elements.len(),
            elements.iter().filter(|e| e.illuminated).count(),
            element_volume,
            element_size
        );

        Ok(Self {
            volume,
            elements,
            element_volume,
            pairs,
        })
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Row of the unordered pair (i, j), i != j, in the packed pair arrays.
    fn pair_index(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        let n = self.elements.len();
        i * (2 * n - i - 1) / 2 + (j - i - 1)
    }

    /// A1, and A2 when requested, for one detector at every wavelength.
    pub fn calculate(&self, detector: &Point3<f64>, wavelengths: &[f64]) -> Vec<QuadratureEstimate> {
        let outgoing: Vec<Vec<f64>> = self
            .elements
            .iter()
            .map(|e| {
                let towards = detector - e.centre;
                let distance = towards.norm();
                component_lengths(self.volume, &e.centre, &(towards / distance), distance)
            })
            .collect();
        let illuminated: Vec<usize> = (0..self.elements.len())
            .filter(|&i| self.elements[i].illuminated)
            .collect();

        wavelengths
            .iter()
            .map(|&wavelength| {
                let coefficients = self.volume.coefficients(wavelength, 1.0);
                let depth = |lengths: ArrayView1<f64>| -> f64 {
                    lengths
                        .iter()
                        .zip(coefficients.attenuation.iter())
                        .map(|(l, mu)| l * mu)
                        .sum()
                };
                let tau_in: Vec<f64> = self
                    .elements
                    .iter()
                    .map(|e| depth(ArrayView1::from(&e.incoming[..])))
                    .collect();
                let tau_out: Vec<f64> = outgoing
                    .iter()
                    .map(|l| depth(ArrayView1::from(&l[..])))
                    .collect();

                let a1 = illuminated
                    .iter()
                    .map(|&i| (-(tau_in[i] + tau_out[i])).exp())
                    .sum::<f64>()
                    / illuminated.len() as f64;

                let a2 = self.pairs.as_ref().map(|pairs| {
                    let tau_pair: Vec<f64> = pairs.lengths.outer_iter().map(|row| depth(row)).collect();
                    let total: f64 = illuminated
                        .iter()
                        .map(|&i| {
                            (0..self.elements.len())
                                .filter(|&j| j != i)
                                .map(|j| {
                                    let p = self.pair_index(i, j);
                                    let mu_s = coefficients.scattering[self.elements[j].component];
                                    (-(tau_in[i] + tau_pair[p] + tau_out[j])).exp() * mu_s
                                        / (4.0 * PI * pairs.distance_squared[p])
                                })
                                .sum::<f64>()
                        })
                        .sum();
                    total * self.element_volume / illuminated.len() as f64
                });

                QuadratureEstimate { a1, a2 }
            })
            .collect()
    }
}

/// Centres of the cubic cells of the region bounding box that fall inside a
/// scatter region component, with that component.
fn element_centres(
    volume: &InteractionVolume,
    element_size: f64,
    max_elements: usize,
) -> Result<Vec<(Point3<f64>, usize)>> {
    let region = volume.region_box();
    let size = region.size();
    let counts = size.map(|s| ((s / element_size).ceil() as usize).max(1));
    let step = Vector3::new(
        size.x / counts.x as f64,
        size.y / counts.y as f64,
        size.z / counts.z as f64,
    );

    let mut centres = Vec::new();
    for i in 0..counts.x {
        for j in 0..counts.y {
            for k in 0..counts.z {
                let centre = region.min
                    + Vector3::new(
                        (i as f64 + 0.5) * step.x,
                        (j as f64 + 0.5) * step.y,
                        (k as f64 + 0.5) * step.z,
                    );
                if let Some(component) = volume.component_at(&centre) {
                    if volume.in_region(component) {
                        centres.push((centre, component));
                        ensure!(
                            centres.len() <= max_elements,
                            "quadrature needs more than max_elements ({}) elements at element_size {}",
                            max_elements,
                            element_size
                        );
                    }
                }
            }
        }
    }
    ensure!(
        !centres.is_empty(),
        "quadrature.element_size {} is too coarse to place any element in the scatter region",
        element_size
    );
    Ok(centres)
}

/// Path length inside each component along a ray, up to `distance`.
fn component_lengths(
    volume: &InteractionVolume,
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    distance: f64,
) -> Vec<f64> {
    let mut lengths = vec![0.0; volume.components.len()];
    for link in volume.intercept(origin, direction) {
        lengths[link.component] += link.length_before(distance);
    }
    lengths
}
