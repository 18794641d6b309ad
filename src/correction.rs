//! Correction run orchestration.
//!
//! A [`CorrectionRun`] owns the interaction volume and scattering
//! distribution built from the settings, selects one [`Estimator`] for the
//! whole run and evaluates it for every unmasked spectrum in parallel. Each
//! work item owns its random stream, seeded from the run seed and the item
//! index, so results do not depend on the number of threads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::convergence::Convergence;
use crate::interpolation::simulated_indices;
use crate::output;
use crate::quadrature::{Quadrature, QuadratureEstimate};
use crate::result::{QuadratureResult, Results};
use crate::settings::{validate_config, Settings};
use crate::sparse::SparseGrid;
use crate::statistics::InteractionStatistics;
use crate::strategy::{AttenuationEstimate, MonteCarloStrategy};
use crate::structure_factor::ScatteringDistribution;
use crate::transport::Transport;
use crate::volume::InteractionVolume;


/// How correction factors are obtained.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    #[default]
    #[value(name = "monte_carlo")]
    MonteCarlo,
    Sparse,
    Quadrature,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::MonteCarlo => write!(f, "monte_carlo"),
            Method::Sparse => write!(f, "sparse"),
            Method::Quadrature => write!(f, "quadrature"),
        }
    }
}

/// The estimator chosen for a run, borrowing the run's geometry.
pub enum Estimator<'a> {
    /// Full Monte Carlo for every spectrum.
    MonteCarlo(MonteCarloStrategy<'a>),
    /// Monte Carlo on a coarse detector lattice, interpolated onto the spectra.
    Sparse(MonteCarloStrategy<'a>, SparseGrid),
    /// Pairwise quadrature of single and double scattering.
    Quadrature(Quadrature<'a>),
}

/// What one work item produced for one spectrum.
struct SpectrumOutcome {
    index: usize,
    orders: Vec<Vec<AttenuationEstimate>>, // [order][wavelength]
    quadrature: Option<Vec<QuadratureEstimate>>,
    stats: InteractionStatistics,
}

/// A complete correction run over every spectrum of the instrument.
///
/// **Context**: Every spectrum needs its own correction curve, but the
/// geometry, materials and scattering law are shared. Building those once and
/// lending them to parallel workers keeps the per spectrum cost to transport
/// alone.
///
/// **How it Works**: `new` builds and validates the interaction volume, so
/// geometry errors surface before any simulation. `solve` picks the estimator,
/// maps it over the spectra with rayon and gathers the rows, statistics and
/// optional quadrature table into [`Results`]. `writeup` hands them to
/// [`output`].
#[derive(Debug)]
pub struct CorrectionRun {
    pub settings: Settings,
    pub volume: InteractionVolume,
    pub distribution: ScatteringDistribution,
    results: Option<Results>,
    cancel: Arc<AtomicBool>,
}

impl CorrectionRun {
    pub fn new(settings: Settings) -> Result<Self> {
        validate_config(&settings)?;
        let components = std::iter::once(settings.sample.clone())
            .chain(settings.environment.iter().cloned())
            .collect();
        let volume = InteractionVolume::new(
            components,
            settings.beam.as_ref(),
            settings.scatter_region,
            settings.max_scatter_attempts,
        )
        .context("could not build the interaction volume")?;
        let distribution = ScatteringDistribution::from_settings(settings.structure_factor.as_ref())
            .context("invalid structure_factor")?;

        Ok(Self {
            settings,
            volume,
            distribution,
            results: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the run before the next spectrum when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn results(&self) -> Option<&Results> {
        self.results.as_ref()
    }

    pub fn solve(&mut self) -> Result<()> {
        let start = Instant::now();
        println!("Solving {} spectra...", self.settings.detectors.len());

        let results = self.run()?;

        let duration = start.elapsed();
        let spectra = results.num_spectra().saturating_sub(results.masked.len()).max(1);
        println!(
            "Time taken: {:.2?}, Time per spectrum: {:.2?}",
            duration,
            duration / spectra as u32
        );
        println!("Results:");
        results.print();

        self.results = Some(results);
        Ok(())
    }

    pub fn writeup(&self) -> Result<()> {
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| anyhow!("nothing to write: the run has not been solved"))?;
        output::writeup(results, &self.settings)
    }

    fn estimator(&self, positions: &[Point3<f64>]) -> Result<Estimator<'_>> {
        let settings = &self.settings;
        let transport = Transport::new(
            &self.volume,
            &self.distribution,
            settings.emode,
            settings.fixed_wavelength(),
        );
        let strategy = MonteCarloStrategy::new(
            transport,
            settings.orders(),
            settings.regenerate_tracks_per_wavelength,
            Convergence::new(
                settings.events_per_point,
                settings.target_relative_error,
                settings.max_events,
            ),
        );

        Ok(match settings.method {
            Method::MonteCarlo => Estimator::MonteCarlo(strategy),
            Method::Sparse => {
                let sparse = settings
                    .sparse
                    .as_ref()
                    .ok_or_else(|| anyhow!("method 'sparse' needs a [sparse] table"))?;
                let unmasked: Vec<Point3<f64>> = positions
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !settings.detectors.is_masked(*i))
                    .map(|(_, p)| *p)
                    .collect();
                let grid = SparseGrid::new(
                    sparse,
                    &unmasked,
                    settings.wavelengths.min,
                    settings.wavelengths.max,
                    settings.orders().len(),
                )?;
                Estimator::Sparse(strategy, grid)
            }
            Method::Quadrature => {
                let quadrature = Quadrature::new(
                    &self.volume,
                    &self.distribution,
                    settings.emode,
                    &settings.quadrature,
                    &settings.orders(),
                )?;
                info!("quadrature over {} volume elements", quadrature.element_count());
                Estimator::Quadrature(quadrature)
            }
        })
    }

    fn run(&self) -> Result<Results> {
        let settings = &self.settings;
        let wavelengths = settings.wavelengths.values();
        let positions = settings.detectors.positions();
        let seed = settings.seed.unwrap_or_else(rand::random);
        let orders = settings.orders();
        info!("run seed {}", seed);

        let sample = &settings.sample.material;
        if let (Some(first), Some(last)) = (wavelengths.first(), wavelengths.last()) {
            debug!(
                "sample mean free path {:.4e} m at {:.3} A, {:.4e} m at {:.3} A",
                sample.mean_free_path(*first, 1.0),
                first,
                sample.mean_free_path(*last, 1.0),
                last
            );
        }

        let mut estimator = self.estimator(&positions)?;

        // lattice events are counted while the grid is simulated
        let mut grid_stats = InteractionStatistics::new();
        if let Estimator::Sparse(strategy, grid) = &mut estimator {
            grid_stats = self.simulate_grid(strategy, grid, seed)?;
        }

        let spectra: Vec<usize> = (0..positions.len())
            .filter(|&i| !settings.detectors.is_masked(i))
            .collect();
        let pb = progress_bar(spectra.len(), "spectrum");

        let outcomes: Vec<Option<SpectrumOutcome>> = spectra
            .par_iter()
            .map(|&index| -> Result<Option<SpectrumOutcome>> {
                if self.cancel.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64));
                let outcome =
                    self.spectrum(&estimator, index, &positions[index], &wavelengths, &mut rng)?;
                pb.inc(1);
                Ok(Some(outcome))
            })
            .collect::<Result<_>>()?;
        pb.finish_and_clear();

        if self.cancel.load(Ordering::Relaxed) {
            bail!("run cancelled before every spectrum was solved");
        }

        let mut results = Results::new_empty(
            wavelengths.clone(),
            positions.clone(),
            settings.detectors.masked().to_vec(),
            orders.clone(),
        );
        results.seed = seed;
        if let Estimator::Quadrature(_) = estimator {
            results.quadrature = Some(QuadratureResult::new_empty(
                positions.len(),
                wavelengths.len(),
                orders.contains(&2),
            ));
        }
        results.stats += grid_stats;

        for outcome in outcomes.into_iter().flatten() {
            for (order_index, estimates) in outcome.orders.iter().enumerate() {
                results.set_spectrum(order_index, outcome.index, estimates);
            }
            if let (Some(table), Some(estimates)) = (results.quadrature.as_mut(), &outcome.quadrature) {
                table.set_spectrum(outcome.index, estimates);
            }
            results.stats += outcome.stats;
        }
        results.finish(settings.sum_orders);

        let dropped = results.stats.drop_fraction();
        if dropped > settings.drop_warning_fraction {
            warn!(
                "{:.2}% of events were dropped (threshold {:.2}%); check the beam and scatter region",
                100.0 * dropped,
                100.0 * settings.drop_warning_fraction
            );
        }

        Ok(results)
    }

    /// Simulates every lattice node of a sparse grid in parallel.
    fn simulate_grid(
        &self,
        strategy: &MonteCarloStrategy<'_>,
        grid: &mut SparseGrid,
        seed: u64,
    ) -> Result<InteractionStatistics> {
        let nodes = grid.node_positions();
        info!(
            "simulating a {} x {} sparse grid at {} wavelengths",
            grid.rows(),
            grid.columns(),
            grid.wavelengths.len()
        );
        let pb = progress_bar(nodes.len(), "grid node");
        let wavelengths = grid.wavelengths.clone();

        let simulated: Vec<Option<(Vec<Vec<AttenuationEstimate>>, InteractionStatistics)>> = nodes
            .par_iter()
            .enumerate()
            .map(|(node, position)| {
                if self.cancel.load(Ordering::Relaxed) {
                    return None;
                }
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(node as u64));
                let mut stats = InteractionStatistics::new();
                let estimates = strategy.calculate(&mut rng, position, &wavelengths, &mut stats);
                pb.inc(1);
                Some((estimates, stats))
            })
            .collect();
        pb.finish_and_clear();

        if self.cancel.load(Ordering::Relaxed) {
            bail!("run cancelled while the sparse grid was simulated");
        }

        let mut total = InteractionStatistics::new();
        for (node, (estimates, stats)) in simulated.into_iter().flatten().enumerate() {
            for (order_index, order) in estimates.iter().enumerate() {
                grid.set_node(order_index, node, order);
            }
            total += stats;
        }
        Ok(total)
    }

    /// Evaluates the estimator for one spectrum.
    fn spectrum(
        &self,
        estimator: &Estimator<'_>,
        index: usize,
        detector: &Point3<f64>,
        wavelengths: &[f64],
        rng: &mut StdRng,
    ) -> Result<SpectrumOutcome> {
        let settings = &self.settings;
        let mut stats = InteractionStatistics::new();

        let (orders, quadrature) = match estimator {
            Estimator::MonteCarlo(strategy) => {
                let points = settings.wavelength_points.unwrap_or(wavelengths.len());
                let indices = simulated_indices(wavelengths.len(), points);
                let simulated: Vec<f64> = indices.iter().map(|&i| wavelengths[i]).collect();
                let estimates = strategy.calculate(rng, detector, &simulated, &mut stats);
                let orders = if simulated.len() == wavelengths.len() {
                    estimates
                } else {
                    estimates
                        .iter()
                        .map(|order| self.fill_wavelengths(&simulated, order, wavelengths))
                        .collect::<Result<_>>()?
                };
                (orders, None)
            }
            Estimator::Sparse(_, grid) => {
                let orders = (0..settings.orders().len())
                    .map(|order_index| {
                        grid.spectrum(
                            order_index,
                            detector,
                            wavelengths,
                            settings.interpolation,
                            settings.extrapolation,
                        )
                    })
                    .collect::<Result<_>>()?;
                (orders, None)
            }
            Estimator::Quadrature(quadrature) => {
                let table = quadrature.calculate(detector, wavelengths);
                let orders = settings
                    .orders()
                    .iter()
                    .map(|&order| {
                        table
                            .iter()
                            .map(|q| AttenuationEstimate {
                                value: if order == 1 { q.a1 } else { q.a2.unwrap_or(0.0) },
                                error: 0.0,
                            })
                            .collect()
                    })
                    .collect();
                (orders, Some(table))
            }
        };

        Ok(SpectrumOutcome {
            index,
            orders,
            quadrature,
            stats,
        })
    }

    /// Interpolates values and errors of the simulated points onto every wavelength.
    fn fill_wavelengths(
        &self,
        simulated: &[f64],
        estimates: &[AttenuationEstimate],
        wavelengths: &[f64],
    ) -> Result<Vec<AttenuationEstimate>> {
        let kind = self.settings.interpolation;
        let extrapolation = self.settings.extrapolation;
        let values: Vec<f64> = estimates.iter().map(|e| e.value).collect();
        let errors: Vec<f64> = estimates.iter().map(|e| e.error).collect();
        let values = kind.interpolate(simulated, &values, wavelengths, extrapolation)?;
        let errors = kind.interpolate(simulated, &errors, wavelengths, extrapolation)?;
        Ok(values
            .into_iter()
            .zip(errors)
            .map(|(value, error)| AttenuationEstimate { value, error })
            .collect())
    }
}

fn progress_bar(len: usize, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
    ) {
        pb.set_style(style.progress_chars("█▇▆▅▄▃▂▁"));
    }
    pb.set_message(message.to_string());
    pb
}
