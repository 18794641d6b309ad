//! Weighted random walks through the interaction volume.
//!
//! An event of order n starts with a scattering point on the incident beam,
//! scatters n - 1 more times inside the scatter region and finally heads for
//! the detector. The walk's weight collects the survival probability of every
//! leg over the density the leg was sampled with, the scattering probability
//! at every later point and the angular factor of every deflection, so that
//! the ratio of summed weights to summed incident chords is the correction
//! factor of that order.
//!
//! Every quantity the weight depends on is recorded on the track, which lets
//! [`Transport::reweight`] evaluate the same walk at another wavelength.

use std::f64::consts::PI;
use std::fmt;

use nalgebra::{Point3, Vector3};
use rand::Rng;
use rand_distr::{Distribution, UnitSphere};
use serde::{Deserialize, Serialize};

use crate::settings::MAX_SCATTER_ORDER;
use crate::statistics::InteractionStatistics;
use crate::structure_factor::{QSampler, ScatteringDistribution};
use crate::track::{Deflection, EventFailure, Exit, Track};
use crate::volume::{inside_length, optical_depth, Coefficients, InteractionVolume};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Shape;
    use crate::material::Material;
    use crate::volume::{Component, ScatterRegion};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vanadium(scatter_xs: f64, absorb_xs: f64) -> InteractionVolume {
        let sample = Component::new(
            "sample",
            Shape::Cylinder {
                base: Point3::new(0.0, -0.02, 0.0),
                axis: Vector3::y(),
                radius: 0.006,
                height: 0.04,
            },
            Material::new("V", 0.072, scatter_xs, absorb_xs),
        );
        InteractionVolume::new(vec![sample], None, ScatterRegion::Sample, 1000).unwrap()
    }

    fn forward_detector() -> Point3<f64> {
        Point3::new(0.0, 0.0, 5.0)
    }

    #[test]
    fn wavenumbers_per_mode() {
        let (ki, kf) = EMode::Elastic.wavenumbers(2.0, None);
        assert_eq!(ki, kf);
        assert!((ki - PI).abs() < 1e-12);
        let (ki, kf) = EMode::Direct.wavenumbers(2.0, Some(1.0));
        assert!((ki - 2.0 * PI).abs() < 1e-12 && (kf - PI).abs() < 1e-12);
        let (ki, kf) = EMode::Indirect.wavenumbers(2.0, Some(1.0));
        assert!((ki - PI).abs() < 1e-12 && (kf - 2.0 * PI).abs() < 1e-12);
    }

    #[test]
    fn momentum_transfer_limits() {
        assert!(momentum_transfer(2.0, 2.0, 1.0).abs() < 1e-12);
        assert!((momentum_transfer(2.0, 2.0, -1.0) - 4.0).abs() < 1e-12);
        assert!((momentum_transfer(3.0, 1.0, 1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn new_direction_has_requested_angle() {
        let old = Vector3::new(0.3, -0.4, 0.866).normalize();
        for &(cos, phi) in &[(0.5, 0.1), (-0.9, 2.0), (1.0, 0.0), (0.0, 4.0)] {
            let new = update_track_direction(&old, cos, phi);
            assert!((new.norm() - 1.0).abs() < 1e-12);
            assert!((new.dot(&old) - cos).abs() < 1e-12);
        }
        let along_z = update_track_direction(&Vector3::z(), 0.0, 0.0);
        assert!(along_z.z.abs() < 1e-12);
    }

    #[test]
    fn transparent_sample_gives_chord_weight() {
        let volume = vanadium(0.0, 0.0);
        let distribution = ScatteringDistribution::isotropic();
        let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
        let point = transport.point(2.0);
        let mut rng = StdRng::seed_from_u64(1);
        let mut stats = InteractionStatistics::new();
        for _ in 0..50 {
            let outcome = transport
                .scatter(1, &mut rng, &point, &forward_detector(), &mut stats)
                .unwrap();
            assert!(outcome.detected);
            assert_eq!(outcome.weight, outcome.chord);
        }
    }

    #[test]
    fn reweight_reproduces_sampled_weight() {
        let volume = vanadium(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
        let point = transport.point(3.0);
        let mut rng = StdRng::seed_from_u64(2);
        let mut stats = InteractionStatistics::new();
        for order in 1..=3 {
            for _ in 0..20 {
                let outcome = transport
                    .scatter(order, &mut rng, &point, &forward_detector(), &mut stats)
                    .unwrap();
                let again = transport.reweight(&outcome.track, &point);
                assert!(
                    (again - outcome.weight).abs() <= 1e-9 * outcome.weight.max(1e-300),
                    "order {}: {} vs {}",
                    order,
                    again,
                    outcome.weight
                );
            }
        }
    }

    #[test]
    fn higher_orders_record_every_leg() {
        let volume = vanadium(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
        let point = transport.point(1.0);
        let mut rng = StdRng::seed_from_u64(4);
        let mut stats = InteractionStatistics::new();
        let outcome = transport
            .scatter(3, &mut rng, &point, &forward_detector(), &mut stats)
            .unwrap();
        if outcome.detected {
            assert_eq!(outcome.track.legs.len(), 3);
            assert!(outcome.track.exit.is_some());
            assert!(outcome.path_length > 0.0);
        } else {
            assert_eq!(outcome.weight, 0.0);
        }
    }
}

/// Energy transfer mode of the instrument.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EMode {
    #[default]
    Elastic,
    Direct,   // incident energy fixed, the wavelength axis is the final wavelength
    Indirect, // final energy fixed, the wavelength axis is the incident wavelength
}

impl fmt::Display for EMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EMode::Elastic => write!(f, "elastic"),
            EMode::Direct => write!(f, "direct"),
            EMode::Indirect => write!(f, "indirect"),
        }
    }
}

impl EMode {
    /// Incident and final wavenumbers (1/Angstrom) for a point of the
    /// wavelength axis.
    pub fn wavenumbers(&self, wavelength: f64, fixed_wavelength: Option<f64>) -> (f64, f64) {
        let k = 2.0 * PI / wavelength;
        match (self, fixed_wavelength) {
            (EMode::Direct, Some(fixed)) => (2.0 * PI / fixed, k),
            (EMode::Indirect, Some(fixed)) => (k, 2.0 * PI / fixed),
            _ => (k, k),
        }
    }
}

/// |Q| for a deflection by an angle with cosine `cos_theta` taking the
/// wavenumber from `k_inc` to `k_final`.
pub fn momentum_transfer(k_inc: f64, k_final: f64, cos_theta: f64) -> f64 {
    (k_inc * k_inc + k_final * k_final - 2.0 * k_inc * k_final * cos_theta)
        .max(0.0)
        .sqrt()
}

/// Rotates `direction` by a polar angle with cosine `cos_theta` and an
/// azimuth `phi` about itself.
pub fn update_track_direction(direction: &Vector3<f64>, cos_theta: f64, phi: f64) -> Vector3<f64> {
    let cos_theta = cos_theta.clamp(-1.0, 1.0);
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    // any axis not parallel to the direction seeds the perpendicular basis
    let seed = if direction.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let u = direction.cross(&seed).normalize();
    let v = direction.cross(&u);
    (direction * cos_theta + (u * phi.cos() + v * phi.sin()) * sin_theta).normalize()
}

/// Everything the transport needs at one point of the wavelength axis.
#[derive(Debug, Clone, PartialEq)]
pub struct WavelengthPoint {
    pub wavelength: f64,
    pub k_inc: f64,
    pub k_final: f64,
    pub incident: Coefficients,  // at the incident wavenumber
    pub scattered: Coefficients, // at the final wavenumber
    pub first_sampler: Option<QSampler>, // Q of the first, energy changing, scatter
    pub later_sampler: Option<QSampler>, // Q of the elastic scatters that follow
}

/// Result of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub detected: bool,   // false when the walk escaped
    pub weight: f64,
    pub path_length: f64, // distance travelled inside components, detector leg included
    pub chord: f64,       // scatter region chord of the incident ray
    pub track: Track,
}

/// The transport engine: the interaction volume, the angular distribution
/// and the energy mode of a run.
#[derive(Debug, Clone)]
pub struct Transport<'a> {
    pub volume: &'a InteractionVolume,
    pub distribution: &'a ScatteringDistribution,
    pub emode: EMode,
    pub fixed_wavelength: Option<f64>,
}

impl<'a> Transport<'a> {
    pub fn new(
        volume: &'a InteractionVolume,
        distribution: &'a ScatteringDistribution,
        emode: EMode,
        fixed_wavelength: Option<f64>,
    ) -> Self {
        Self {
            volume,
            distribution,
            emode,
            fixed_wavelength,
        }
    }

    /// Coefficients and samplers for one point of the wavelength axis.
    pub fn point(&self, wavelength: f64) -> WavelengthPoint {
        let (k_inc, k_final) = self.emode.wavenumbers(wavelength, self.fixed_wavelength);
        let coefficients = |k: f64| {
            self.volume
                .coefficients(2.0 * PI / k, self.distribution.scale(k, k))
        };
        WavelengthPoint {
            wavelength,
            k_inc,
            k_final,
            incident: coefficients(k_inc),
            scattered: coefficients(k_final),
            first_sampler: self.distribution.sampler(k_inc, k_final),
            later_sampler: self.distribution.sampler(k_final, k_final),
        }
    }

    /// Simulates one event with exactly `n_scatters` scattering points.
    pub fn scatter<R: Rng + ?Sized>(
        &self,
        n_scatters: usize,
        rng: &mut R,
        point: &WavelengthPoint,
        detector: &Point3<f64>,
        stats: &mut InteractionStatistics,
    ) -> Result<TrackOutcome, EventFailure> {
        debug_assert!((1..=MAX_SCATTER_ORDER).contains(&n_scatters));
        stats.events_attempted += 1;

        let mut track = self.volume.start_point(rng, &point.incident, stats)?;

        if n_scatters > 1 {
            for i in 1..n_scatters {
                let (sampler, k_in) = if i == 1 {
                    (point.first_sampler.as_ref(), point.k_inc)
                } else {
                    (point.later_sampler.as_ref(), point.k_final)
                };
                let (direction, deflection) =
                    sample_direction(&track.direction, sampler, k_in, point.k_final, rng);
                track.direction = direction;

                let component = self.volume.update_weight_and_position(
                    &mut track,
                    &point.scattered,
                    rng,
                    deflection,
                )?;
                match component {
                    Some(component) => {
                        let q = momentum_transfer(k_in, point.k_final, deflection.cos_theta);
                        track.scale_weight(
                            point.scattered.scattering[component]
                                * self.angular_factor(q, deflection.direction_density),
                        );
                    }
                    None => {
                        stats.escapes += 1;
                        return Ok(self.outcome(track, false));
                    }
                }
            }
        }

        debug_assert_eq!(track.scatters(), n_scatters);
        self.detector_leg(&mut track, point, detector);
        stats.record_success(n_scatters);
        Ok(self.outcome(track, true))
    }

    /// Weight of a recorded walk evaluated at another wavelength. The
    /// geometry and the sampling densities are those of the original walk.
    pub fn reweight(&self, track: &Track, point: &WavelengthPoint) -> f64 {
        if track.escaped {
            return 0.0;
        }
        let Some(exit) = &track.exit else {
            return 0.0;
        };

        let mut log_weight = 0.0;
        let mut factor = 1.0;
        for (i, leg) in track.legs.iter().enumerate() {
            let coefficients = if i == 0 {
                &point.incident
            } else {
                &point.scattered
            };
            log_weight += leg.shift
                - optical_depth(&leg.links, &coefficients.attenuation, leg.distance);
            factor *= leg.scale;
            if let Some(deflection) = leg.deflection {
                let k_in = if i == 1 { point.k_inc } else { point.k_final };
                let q = momentum_transfer(k_in, point.k_final, deflection.cos_theta);
                factor *= coefficients.scattering[leg.component]
                    * self.angular_factor(q, deflection.direction_density);
            }
        }
        log_weight -= optical_depth(&exit.links, &point.scattered.attenuation, exit.distance);
        factor *= self.detector_ratio(track.legs.len(), exit, point);

        let weight = factor * log_weight.exp();
        if weight.is_finite() {
            weight.max(0.0)
        } else {
            0.0
        }
    }

    /// S(Q) over 4 pi times the sampled direction density.
    fn angular_factor(&self, q: f64, direction_density: f64) -> f64 {
        self.distribution.s_of_q(q) / (4.0 * PI * direction_density)
    }

    /// Structure factor of the final deflection relative to single scattering
    /// into the same detector. Single scattering needs no ratio.
    fn detector_ratio(&self, n_scatters: usize, exit: &Exit, point: &WavelengthPoint) -> f64 {
        if n_scatters < 2 || self.distribution.is_isotropic() {
            return 1.0;
        }
        let last = momentum_transfer(point.k_final, point.k_final, exit.cos_theta);
        let single = momentum_transfer(point.k_inc, point.k_final, exit.single_cos_theta);
        self.distribution.s_of_q(last) / self.distribution.s_of_q(single)
    }

    /// Applies the attenuation towards the detector and the final angular ratio.
    fn detector_leg(&self, track: &mut Track, point: &WavelengthPoint, detector: &Point3<f64>) {
        let to_detector = detector - track.position;
        let distance = to_detector.norm();
        let direction = to_detector / distance;
        let links = self.volume.intercept(&track.position, &direction);

        let first_point = track.legs[0].end;
        let single_direction = (detector - first_point).normalize();
        let exit = Exit {
            cos_theta: track.direction.dot(&direction),
            single_cos_theta: self.volume.beam.direction().dot(&single_direction),
            distance,
            links,
        };

        let tau = optical_depth(&exit.links, &point.scattered.attenuation, distance);
        track.scale_weight((-tau).exp() * self.detector_ratio(track.legs.len(), &exit, point));
        track.path_length += inside_length(&exit.links, distance);
        track.origin = track.position;
        track.direction = direction;
        track.exit = Some(exit);
    }

    fn outcome(&self, track: Track, detected: bool) -> TrackOutcome {
        TrackOutcome {
            detected,
            weight: if detected { track.weight } else { 0.0 },
            path_length: track.path_length,
            chord: track.chord,
            track,
        }
    }
}

/// Draws a new direction about `current`: isotropically, or with Q importance
/// sampled from the structure factor when a sampler is given.
fn sample_direction<R: Rng + ?Sized>(
    current: &Vector3<f64>,
    sampler: Option<&QSampler>,
    k_in: f64,
    k_out: f64,
    rng: &mut R,
) -> (Vector3<f64>, Deflection) {
    match sampler {
        Some(sampler) => {
            let q = sampler.sample(rng.random());
            let cos_theta =
                ((k_in * k_in + k_out * k_out - q * q) / (2.0 * k_in * k_out)).clamp(-1.0, 1.0);
            let phi = 2.0 * PI * rng.random::<f64>();
            let direction = update_track_direction(current, cos_theta, phi);
            (
                direction,
                Deflection {
                    cos_theta,
                    direction_density: sampler.direction_density(q),
                },
            )
        }
        None => {
            let [x, y, z]: [f64; 3] = UnitSphere.sample(rng);
            let direction = Vector3::new(x, y, z);
            (
                direction,
                Deflection {
                    cos_theta: current.dot(&direction).clamp(-1.0, 1.0),
                    direction_density: 1.0 / (4.0 * PI),
                },
            )
        }
    }
}
