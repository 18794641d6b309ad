//! Monte Carlo estimation of correction factors for one detector.
//!
//! Each event yields a weight w and the scatter region chord c of its
//! incident ray. The correction factor is the ratio of sums, so that
//! events are averaged over the illuminated volume rather than over beam
//! area. Dropped events do not enter either sum; escaped walks enter with
//! w = 0.

use log::warn;
use nalgebra::Point3;
use rand::Rng;
use serde::Serialize;

use crate::convergence::Convergence;
use crate::statistics::InteractionStatistics;
use crate::transport::{Transport, WavelengthPoint};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Shape;
    use crate::material::Material;
    use crate::structure_factor::ScatteringDistribution;
    use crate::transport::EMode;
    use crate::volume::{Component, InteractionVolume, ScatterRegion};
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn volume(scatter_xs: f64, absorb_xs: f64) -> InteractionVolume {
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

    #[test]
    fn ratio_of_identical_sums_is_exactly_one() {
        let mut acc = RatioAccumulator::new();
        for c in [0.1, 0.2, 0.35] {
            acc.push(c, c);
        }
        let estimate = acc.estimate().unwrap();
        assert_eq!(estimate.value, 1.0);
        assert_eq!(estimate.error, 0.0);
    }

    #[test]
    fn empty_accumulator_has_no_estimate() {
        assert!(RatioAccumulator::new().estimate().is_none());
    }

    #[test]
    fn ratio_error_matches_hand_calculation() {
        let mut acc = RatioAccumulator::new();
        acc.push(1.0, 1.0);
        acc.push(0.0, 1.0);
        let estimate = acc.estimate().unwrap();
        assert_eq!(estimate.value, 0.5);
        // residuals +-0.5, variance 0.5, error sqrt(0.5 / 2)
        assert!((estimate.error - 0.5).abs() < 1e-12);
    }

    #[test]
    fn single_scattering_absorption_is_bounded() {
        let volume = volume(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
        let strategy = MonteCarloStrategy::new(transport, vec![1], true, Convergence::new(200, None, None));
        let mut rng = StdRng::seed_from_u64(21);
        let mut stats = InteractionStatistics::new();
        let estimates = strategy.calculate(
            &mut rng,
            &Point3::new(0.0, 0.0, 5.0),
            &[0.5, 4.5, 9.5],
            &mut stats,
        );
        let values: Vec<f64> = estimates[0].iter().map(|e| e.value).collect();
        assert!(values.iter().all(|&v| v > 0.0 && v <= 1.0), "{:?}", values);
        assert!(values[0] > values[1] && values[1] > values[2], "{:?}", values);
        assert_eq!(stats.events_attempted, 600);
    }

    #[test]
    fn every_event_dropped_gives_zero_cells() {
        let mut volume = volume(5.1, 5.08);
        volume.max_scatter_attempts = 0;
        let distribution = ScatteringDistribution::isotropic();
        for regenerate in [true, false] {
            let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
            let strategy =
                MonteCarloStrategy::new(transport, vec![1], regenerate, Convergence::new(50, None, None));
            let mut rng = StdRng::seed_from_u64(2);
            let mut stats = InteractionStatistics::new();
            let estimates =
                strategy.calculate(&mut rng, &Point3::new(0.0, 0.0, 5.0), &[1.0, 2.0], &mut stats);
            assert!(estimates[0].iter().all(|e| *e == AttenuationEstimate::default()));
            assert!(stats.events_dropped > 0);
            assert_eq!(stats.events_dropped, stats.no_start_point);
            assert_eq!(stats.drop_fraction(), 1.0);
        }
    }

    #[test]
    fn reused_tracks_agree_with_regenerated_ones() {
        let volume = volume(5.1, 5.08);
        let distribution = ScatteringDistribution::isotropic();
        let wavelengths = [1.0, 3.0, 5.0];
        let detector = Point3::new(0.0, 0.0, 5.0);
        let run = |regenerate: bool| {
            let transport = Transport::new(&volume, &distribution, EMode::Elastic, None);
            let strategy =
                MonteCarloStrategy::new(transport, vec![1], regenerate, Convergence::new(2000, None, None));
            let mut rng = StdRng::seed_from_u64(8);
            let mut stats = InteractionStatistics::new();
            strategy.calculate(&mut rng, &detector, &wavelengths, &mut stats)
        };
        let fresh = run(true);
        let reused = run(false);
        for (a, b) in fresh[0].iter().zip(reused[0].iter()) {
            let tolerance = 4.0 * (a.error.powi(2) + b.error.powi(2)).sqrt() + 1e-3;
            assert!((a.value - b.value).abs() < tolerance, "{:?} vs {:?}", a, b);
        }
    }
}

/// A correction factor and its standard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AttenuationEstimate {
    pub value: f64,
    pub error: f64,
}

impl AttenuationEstimate {
    pub fn relative_error(&self) -> f64 {
        if self.error == 0.0 {
            0.0
        } else if self.value == 0.0 {
            f64::INFINITY
        } else {
            (self.error / self.value).abs()
        }
    }
}

/// Running sums for the ratio estimator sum(w) / sum(c).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatioAccumulator {
    weights: Vec<f64>,
    chords: Vec<f64>,
}

impl RatioAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, weight: f64, chord: f64) {
        self.weights.push(weight);
        self.chords.push(chord);
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Ratio of sums and its standard error from the residuals w - A c.
    pub fn estimate(&self) -> Option<AttenuationEstimate> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let total_weight: f64 = self.weights.iter().sum();
        let total_chord: f64 = self.chords.iter().sum();
        if !(total_chord > 0.0) {
            return None;
        }
        let value = total_weight / total_chord;
        if n < 2 {
            return Some(AttenuationEstimate { value, error: 0.0 });
        }

        let residual: f64 = self
            .weights
            .iter()
            .zip(self.chords.iter())
            .map(|(w, c)| (w - value * c).powi(2))
            .sum();
        let mean_chord = total_chord / n as f64;
        let error = (residual / (n - 1) as f64).sqrt() / (mean_chord * (n as f64).sqrt());
        Some(AttenuationEstimate { value, error })
    }
}

/// Monte Carlo correction for one detector position at a set of wavelengths.
#[derive(Debug, Clone)]
pub struct MonteCarloStrategy<'a> {
    pub transport: Transport<'a>,
    pub orders: Vec<usize>,
    pub regenerate_tracks_per_wavelength: bool,
    pub convergence: Convergence,
}

impl<'a> MonteCarloStrategy<'a> {
    pub fn new(
        transport: Transport<'a>,
        orders: Vec<usize>,
        regenerate_tracks_per_wavelength: bool,
        convergence: Convergence,
    ) -> Self {
        Self {
            transport,
            orders,
            regenerate_tracks_per_wavelength,
            convergence,
        }
    }

    /// Estimates for every configured order (outer) at every wavelength (inner).
    pub fn calculate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        detector: &Point3<f64>,
        wavelengths: &[f64],
        stats: &mut InteractionStatistics,
    ) -> Vec<Vec<AttenuationEstimate>> {
        let points: Vec<WavelengthPoint> =
            wavelengths.iter().map(|&w| self.transport.point(w)).collect();

        self.orders
            .iter()
            .map(|&order| {
                let accumulators = if self.regenerate_tracks_per_wavelength {
                    points
                        .iter()
                        .map(|point| self.regenerated(order, rng, point, detector, stats))
                        .collect()
                } else {
                    self.reweighted(order, rng, &points, detector, stats)
                };
                accumulators
                    .iter()
                    .zip(wavelengths)
                    .map(|(acc, &wavelength)| finish(acc, order, wavelength))
                    .collect()
            })
            .collect()
    }

    /// Fresh events at a single wavelength.
    fn regenerated<R: Rng + ?Sized>(
        &self,
        order: usize,
        rng: &mut R,
        point: &WavelengthPoint,
        detector: &Point3<f64>,
        stats: &mut InteractionStatistics,
    ) -> RatioAccumulator {
        let mut acc = RatioAccumulator::new();
        let mut done = 0;
        let mut current: Vec<AttenuationEstimate> = Vec::new();
        while let Some(batch) = self.convergence.next_batch(done, &current) {
            for _ in 0..batch {
                match self.transport.scatter(order, rng, point, detector, stats) {
                    Ok(outcome) => acc.push(outcome.weight, outcome.chord),
                    Err(failure) => stats.record_failure(failure),
                }
            }
            done += batch;
            current = acc.estimate().into_iter().collect();
        }
        acc
    }

    /// Events generated once at the middle wavelength and re-weighted at
    /// every other one.
    fn reweighted<R: Rng + ?Sized>(
        &self,
        order: usize,
        rng: &mut R,
        points: &[WavelengthPoint],
        detector: &Point3<f64>,
        stats: &mut InteractionStatistics,
    ) -> Vec<RatioAccumulator> {
        let mut accumulators = vec![RatioAccumulator::new(); points.len()];
        let Some(reference) = points.get(points.len() / 2) else {
            return accumulators;
        };
        let mut done = 0;
        let mut current: Vec<AttenuationEstimate> = Vec::new();
        while let Some(batch) = self.convergence.next_batch(done, &current) {
            for _ in 0..batch {
                match self.transport.scatter(order, rng, reference, detector, stats) {
                    Ok(outcome) => {
                        for (acc, point) in accumulators.iter_mut().zip(points) {
                            acc.push(self.transport.reweight(&outcome.track, point), outcome.chord);
                        }
                    }
                    Err(failure) => stats.record_failure(failure),
                }
            }
            done += batch;
            current = accumulators.iter().filter_map(|a| a.estimate()).collect();
        }
        accumulators
    }
}

/// The estimate of an accumulator, or zero with a warning when no event survived.
fn finish(acc: &RatioAccumulator, order: usize, wavelength: f64) -> AttenuationEstimate {
    acc.estimate().unwrap_or_else(|| {
        warn!(
            "no events survived for scattering order {} at {:.4} A; the point is set to zero",
            order, wavelength
        );
        AttenuationEstimate::default()
    })
}
