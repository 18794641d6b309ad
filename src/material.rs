//! Neutron cross sections of the sample and environment materials.
//!
//! Lengths in the geometry are metres, cross sections are barns and number
//! densities are atoms per cubic Angstrom, so a macroscopic coefficient
//! `n * sigma` comes out in 1/m after multiplying by [`COEFFICIENT_UNITS`].

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;

    fn vanadium() -> Material {
        Material::new("V", 0.072, 5.1, 5.08)
    }

    #[test]
    fn absorption_scales_with_wavelength() {
        let material = vanadium();
        assert!((material.absorb_xs(REFERENCE_WAVELENGTH) - 5.08).abs() < 1e-12);
        assert!((material.absorb_xs(2.0 * REFERENCE_WAVELENGTH) - 10.16).abs() < 1e-12);
    }

    #[test]
    fn attenuation_coefficient_units() {
        let material = vanadium();
        // 100 * 0.072 * (5.1 + 5.08) per metre at the reference wavelength
        let mu = material.attenuation_coefficient(REFERENCE_WAVELENGTH, 1.0);
        assert!((mu - 73.296).abs() < 1e-9, "mu: {}", mu);
    }

    #[test]
    fn transparent_material_has_no_attenuation() {
        let material = Material::new("void", 0.0, 0.0, 0.0);
        assert_eq!(material.attenuation_coefficient(4.0, 1.0), 0.0);
        assert!(material.validate().is_ok());
    }

    #[test]
    fn negative_density_rejected() {
        let material = Material::new("bad", -1.0, 1.0, 1.0);
        let err = material.validate().unwrap_err().to_string();
        assert!(err.contains("number_density"), "{}", err);
    }
}

/// Wavelength (Angstrom) at which tabulated absorption cross sections are quoted.
pub const REFERENCE_WAVELENGTH: f64 = 1.7982;
/// Converts atoms/Angstrom^3 * barn into 1/m.
pub const COEFFICIENT_UNITS: f64 = 100.0;

/// Scattering and absorption properties of a homogeneous material.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Material {
    pub name: String,
    pub number_density: f64, // atoms per cubic Angstrom
    pub scatter_xs: f64,     // bound total scattering cross section, barn
    pub absorb_xs: f64,      // absorption cross section at the reference wavelength, barn
}

impl Material {
    pub fn new(name: &str, number_density: f64, scatter_xs: f64, absorb_xs: f64) -> Self {
        Self {
            name: name.to_string(),
            number_density,
            scatter_xs,
            absorb_xs,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.number_density >= 0.0 && self.number_density.is_finite(),
            "material '{}': number_density must be finite and non-negative, got {}",
            self.name,
            self.number_density
        );
        ensure!(
            self.scatter_xs >= 0.0 && self.scatter_xs.is_finite(),
            "material '{}': scatter_xs must be finite and non-negative, got {}",
            self.name,
            self.scatter_xs
        );
        ensure!(
            self.absorb_xs >= 0.0 && self.absorb_xs.is_finite(),
            "material '{}': absorb_xs must be finite and non-negative, got {}",
            self.name,
            self.absorb_xs
        );
        Ok(())
    }

    /// Absorption cross section at `wavelength`, assuming the 1/v law.
    pub fn absorb_xs(&self, wavelength: f64) -> f64 {
        self.absorb_xs * wavelength / REFERENCE_WAVELENGTH
    }

    /// Macroscopic scattering coefficient in 1/m. `scale` is the structure
    /// factor weighting of the bound cross section (1 for isotropic).
    pub fn scattering_coefficient(&self, scale: f64) -> f64 {
        COEFFICIENT_UNITS * self.number_density * self.scatter_xs * scale
    }

    /// Macroscopic absorption coefficient in 1/m.
    pub fn absorption_coefficient(&self, wavelength: f64) -> f64 {
        COEFFICIENT_UNITS * self.number_density * self.absorb_xs(wavelength)
    }

    /// Linear attenuation coefficient mu(lambda) = n * (sigma_s + sigma_a(lambda)).
    pub fn attenuation_coefficient(&self, wavelength: f64, scale: f64) -> f64 {
        self.scattering_coefficient(scale) + self.absorption_coefficient(wavelength)
    }

    /// Mean free path in metres, infinite for a transparent material.
    pub fn mean_free_path(&self, wavelength: f64, scale: f64) -> f64 {
        let mu = self.attenuation_coefficient(wavelength, scale);
        if mu > 0.0 {
            1.0 / mu
        } else {
            f64::INFINITY
        }
    }
}
