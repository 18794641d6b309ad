use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::beam::BeamProfile;
use crate::correction::Method;
use crate::geom::Shape;
use crate::instrument::{DetectorLayout, WavelengthGrid};
use crate::interpolation::{Extrapolation, Interpolation};
use crate::quadrature::QuadratureSettings;
use crate::sparse::SparseSettings;
use crate::structure_factor::StructureFactorSettings;
use crate::transport::EMode;
use crate::volume::{Component, ScatterRegion};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let settings = load_default_config().unwrap();
        assert!(validate_config(&settings).is_ok());
        assert_eq!(settings.sample.material.name, "V");
        assert!(settings.environment.is_empty());
    }

    #[test]
    fn too_few_points_for_spline() {
        let mut settings = load_default_config().unwrap();
        settings.interpolation = Interpolation::CSpline;
        settings.wavelength_points = Some(2);
        let err = validate_config(&settings).unwrap_err().to_string();
        assert!(err.contains("wavelength_points"), "{}", err);
    }

    #[test]
    fn inelastic_needs_fixed_energy() {
        let mut settings = load_default_config().unwrap();
        settings.emode = EMode::Direct;
        settings.fixed_energy = None;
        let err = validate_config(&settings).unwrap_err().to_string();
        assert!(err.contains("fixed_energy"), "{}", err);
    }

    #[test]
    fn energy_wavelength_conversion() {
        // 81.8042 meV neutrons have a wavelength of one Angstrom
        assert!((energy_to_wavelength(81.8042) - 1.0).abs() < 1e-12);
        assert!((energy_to_wavelength(25.3) - 1.798).abs() < 1e-3);
    }

    #[test]
    fn snapshot_round_trips_through_toml() {
        let settings = load_default_config().unwrap();
        let text = toml::to_string(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.events_per_point, settings.events_per_point);
        assert_eq!(back.sample.shape, settings.sample.shape);
    }
}

/// Parametric intervals shorter than this (metres) are treated as empty.
pub const INTERVAL_TOLERANCE: f64 = 1e-12;
/// Below this, a direction component or determinant is treated as zero.
pub const PARALLEL_EPSILON: f64 = 1e-12;
/// Default number of tries to find a beam ray that crosses the scatter region.
pub const DEFAULT_MAX_SCATTER_ATTEMPTS: usize = 5000;
/// Largest scattering order a single walk may be asked for.
pub const MAX_SCATTER_ORDER: usize = 10;
/// Probe rays per side used to check that the beam can reach the sample.
pub const PROBE_GRID: usize = 32;
/// E[meV] * lambda[A]^2 for neutrons.
pub const ENERGY_WAVELENGTH_PRODUCT: f64 = 81.8042;
/// Fraction of dropped events above which a warning is logged.
pub const DEFAULT_DROP_WARNING_FRACTION: f64 = 0.01;

/// Converts a neutron energy in meV to its wavelength in Angstrom.
pub fn energy_to_wavelength(energy: f64) -> f64 {
    (ENERGY_WAVELENGTH_PRODUCT / energy).sqrt()
}

/// Runtime configuration for a correction run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    pub events_per_point: usize,
    pub scattering_order: usize,
    #[serde(default)]
    pub sum_orders: bool, // simulate every order up to scattering_order and sum them
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub emode: EMode,
    #[serde(default)]
    pub fixed_energy: Option<f64>, // meV, required for direct and indirect
    #[serde(default)]
    pub interpolation: Interpolation,
    #[serde(default)]
    pub wavelength_points: Option<usize>, // simulated points per spectrum, all when unset
    #[serde(default)]
    pub extrapolation: Extrapolation,
    #[serde(default = "default_true")]
    pub regenerate_tracks_per_wavelength: bool,
    #[serde(default = "default_max_scatter_attempts")]
    pub max_scatter_attempts: usize,
    #[serde(default)]
    pub scatter_region: ScatterRegion,
    #[serde(default = "default_drop_warning_fraction")]
    pub drop_warning_fraction: f64,
    #[serde(default)]
    pub target_relative_error: Option<f64>, // keep adding batches until reached
    #[serde(default)]
    pub max_events: Option<usize>, // hard cap on events per point under convergence control
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    pub sample: Component,
    #[serde(default)]
    pub environment: Vec<Component>,
    #[serde(default)]
    pub beam: Option<BeamProfile>, // defaults to the sample cross-section
    pub detectors: DetectorLayout,
    pub wavelengths: WavelengthGrid,
    #[serde(default)]
    pub structure_factor: Option<StructureFactorSettings>,
    #[serde(default)]
    pub sparse: Option<SparseSettings>,
    #[serde(default)]
    pub quadrature: QuadratureSettings,
}

fn default_true() -> bool {
    true
}

fn default_max_scatter_attempts() -> usize {
    DEFAULT_MAX_SCATTER_ATTEMPTS
}

fn default_drop_warning_fraction() -> f64 {
    DEFAULT_DROP_WARNING_FRACTION
}

fn default_directory() -> PathBuf {
    PathBuf::from("muscat_run")
}

impl Settings {
    /// The fixed wavelength in Angstrom, for the inelastic modes.
    pub fn fixed_wavelength(&self) -> Option<f64> {
        self.fixed_energy.map(energy_to_wavelength)
    }

    /// Scattering orders simulated by the run.
    pub fn orders(&self) -> Vec<usize> {
        if self.sum_orders {
            (1..=self.scattering_order).collect()
        } else {
            vec![self.scattering_order]
        }
    }
}

pub fn load_default_config() -> Result<Settings> {
    let muscat_dir = retrieve_project_root()?;
    let default_config_file = muscat_dir.join("config/default.toml");

    let settings: Config = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .context("Error loading configuration")?;

    let config: Settings = settings
        .try_deserialize()
        .context("Error deserializing configuration")?;

    validate_config(&config)?;

    Ok(config)
}

pub fn load_config() -> Result<Settings> {
    let muscat_dir = retrieve_project_root()?;

    let default_config_file = muscat_dir.join("config/default.toml");
    let local_config = muscat_dir.join("config/local.toml");

    // Check if local config exists, if not use default
    let config_file = if local_config.exists() {
        println!("Using local configuration: {:?}", local_config);
        local_config
    } else {
        println!("Using default configuration: {:?}", default_config_file);
        default_config_file
    };

    let settings: Config = Config::builder()
        .add_source(File::from(config_file).required(true))
        .add_source(
            Environment::with_prefix("muscat")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Error loading configuration")?;

    let mut config: Settings = settings
        .try_deserialize()
        .context("Error deserializing configuration")?;

    // Parse command-line arguments and override values
    let args = CliArgs::parse();
    args.apply(&mut config)?;

    validate_config(&config)?;

    println!("{}", config);

    Ok(config)
}

/// Retrieve the project root directory.
/// This function tries to find the project root directory in different ways:
/// 1. If the CARGO_MANIFEST_DIR environment variable is set, use it.
/// 2. If the MUSCAT_ROOT_DIR environment variable is set, use it.
/// 3. If the "config" subdirectory is found in the executable directory or any of its parents, use it.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        // When running through cargo (e.g. cargo run, cargo test)
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("MUSCAT_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }

    let exe_path = env::current_exe().context("Failed to get current executable path")?;
    exe_path
        .ancestors()
        .skip(1)
        .find(|dir| dir.join("config").is_dir())
        .map(|dir| dir.to_path_buf())
        .ok_or_else(|| anyhow!("Could not find project root directory (set MUSCAT_ROOT_DIR)"))
}

pub fn validate_config(config: &Settings) -> Result<()> {
    ensure!(
        config.events_per_point > 0,
        "events_per_point must be greater than 0"
    );
    ensure!(
        (1..=MAX_SCATTER_ORDER).contains(&config.scattering_order),
        "scattering_order must be between 1 and {}, got {}",
        MAX_SCATTER_ORDER,
        config.scattering_order
    );
    ensure!(
        config.max_scatter_attempts > 0,
        "max_scatter_attempts must be greater than 0"
    );
    ensure!(
        (0.0..=1.0).contains(&config.drop_warning_fraction),
        "drop_warning_fraction must lie in [0, 1], got {}",
        config.drop_warning_fraction
    );

    match (config.emode, config.fixed_energy) {
        (EMode::Elastic, _) => {}
        (_, Some(energy)) if energy > 0.0 && energy.is_finite() => {}
        (mode, energy) => bail!(
            "fixed_energy must be a positive energy in meV for emode '{}', got {:?}",
            mode,
            energy
        ),
    }

    if let Some(target) = config.target_relative_error {
        ensure!(
            target > 0.0 && target.is_finite(),
            "target_relative_error must be positive, got {}",
            target
        );
    }
    if let Some(max_events) = config.max_events {
        ensure!(
            max_events >= config.events_per_point,
            "max_events ({}) must be at least events_per_point ({})",
            max_events,
            config.events_per_point
        );
    }

    config.wavelengths.validate()?;
    config.detectors.validate()?;

    if let Some(points) = config.wavelength_points {
        ensure!(
            points <= config.wavelengths.num_points,
            "wavelength_points ({}) exceeds the number of wavelengths ({})",
            points,
            config.wavelengths.num_points
        );
        ensure!(
            points == config.wavelengths.num_points
                || config.interpolation != Interpolation::None,
            "wavelength_points ({}) is below the number of wavelengths but interpolation is 'none'",
            points
        );
        config.interpolation.check_points(points)?;
    }

    for component in std::iter::once(&config.sample).chain(config.environment.iter()) {
        validate_component(component)
            .with_context(|| format!("component '{}'", component.name))?;
    }
    if let Some(beam) = &config.beam {
        beam.validate()?;
    }
    if config.scatter_region == ScatterRegion::Environment {
        ensure!(
            !config.environment.is_empty(),
            "scatter_region 'environment' needs at least one environment component"
        );
    }

    match config.method {
        Method::MonteCarlo => {}
        Method::Sparse => {
            let sparse = config
                .sparse
                .as_ref()
                .ok_or_else(|| anyhow!("method 'sparse' needs a [sparse] table"))?;
            sparse.validate(config.interpolation)?;
        }
        Method::Quadrature => config.quadrature.validate()?,
    }

    Ok(())
}

/// Meshes are only checked for their scale here; their triangles are checked
/// once the interaction volume has loaded them.
fn validate_component(component: &Component) -> Result<()> {
    match &component.shape {
        Shape::Mesh { path, scale, .. } => ensure!(
            *scale > 0.0 && scale.is_finite(),
            "mesh '{}': scale must be finite and positive, got {}",
            path,
            scale
        ),
        shape => shape.validate()?,
    }
    component.material.validate()
}

#[derive(Parser, Debug)]
#[command(version, about = "MUSCAT - Monte Carlo absorption and multiple scattering corrections")]
pub struct CliArgs {
    /// Number of events simulated per detector and wavelength point.
    #[arg(short, long)]
    events: Option<usize>,

    /// Scattering order to simulate (1 for single scattering absorption).
    #[arg(short, long)]
    order: Option<usize>,

    /// Simulate every order up to --order and report the sum as well.
    #[arg(long)]
    sum_orders: bool,

    /// Correction method.
    #[arg(short, long, value_enum)]
    method: Option<Method>,

    /// Energy transfer mode.
    #[arg(long, value_enum)]
    emode: Option<EMode>,

    /// Fixed energy in meV for the direct and indirect modes.
    #[arg(long)]
    efixed: Option<f64>,

    /// Number of simulated wavelength points per spectrum; the rest are interpolated.
    #[arg(short = 'p', long)]
    points: Option<usize>,

    /// Interpolation between simulated wavelength points.
    #[arg(long, value_enum)]
    interpolation: Option<Interpolation>,

    /// Simulate a sparse detector grid with the given numbers of rows and columns.
    #[arg(long, num_args = 2, value_delimiter = ' ')]
    sparse: Option<Vec<usize>>,

    /// Stop adding events once the relative error of every point drops below this.
    #[arg(long)]
    target_error: Option<f64>,

    /// Random seed for the simulation.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Output directory.
    #[arg(short, long)]
    dir: Option<PathBuf>,
}

impl CliArgs {
    /// Overrides configuration values with the ones given on the command line.
    fn apply(self, config: &mut Settings) -> Result<()> {
        if let Some(events) = self.events {
            config.events_per_point = events;
        }
        if let Some(order) = self.order {
            config.scattering_order = order;
        }
        if self.sum_orders {
            config.sum_orders = true;
        }
        if let Some(method) = self.method {
            config.method = method;
        }
        if let Some(emode) = self.emode {
            config.emode = emode;
        }
        if let Some(energy) = self.efixed {
            config.fixed_energy = Some(energy);
        }
        if let Some(points) = self.points {
            config.wavelength_points = Some(points);
        }
        if let Some(interpolation) = self.interpolation {
            config.interpolation = interpolation;
        }
        if let Some(grid) = self.sparse {
            let [rows, columns] = grid[..] else {
                bail!("--sparse needs exactly two values: ROWS COLUMNS");
            };
            let wavelength_points = config
                .sparse
                .as_ref()
                .map(|s| s.wavelength_points)
                .unwrap_or(config.wavelengths.num_points);
            config.sparse = Some(SparseSettings {
                rows,
                columns,
                wavelength_points,
            });
            config.method = Method::Sparse;
        }
        if let Some(target) = self.target_error {
            config.target_relative_error = Some(target);
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(dir) = self.dir {
            config.directory = dir;
        }
        Ok(())
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings:
  - Method: {}
  - Events per point: {}
  - Scattering order: {}{}
  - Energy mode: {}
  - Wavelengths: {} points, {:.4} to {:.4} A
  - Simulated wavelength points: {}
  - Sample: {} ({})
  - Environment components: {}
  - Seed: {:?}
  ",
            self.method,
            self.events_per_point,
            self.scattering_order,
            if self.sum_orders { " (summed)" } else { "" },
            self.emode,
            self.wavelengths.num_points,
            self.wavelengths.min,
            self.wavelengths.max,
            self.wavelength_points
                .map(|p| p.to_string())
                .unwrap_or_else(|| "all".to_string()),
            self.sample.name,
            self.sample.material.name,
            self.environment.len(),
            self.seed,
        )
    }
}
