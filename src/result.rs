use nalgebra::Point3;
use ndarray::{Array2, Zip};

use crate::quadrature::QuadratureEstimate;
use crate::statistics::InteractionStatistics;
use crate::strategy::AttenuationEstimate;

#[cfg(test)]
mod tests {
    use super::*;

    fn results(orders: Vec<usize>) -> Results {
        let detectors = vec![Point3::new(0.0, 0.0, 1.0), Point3::new(1.0, 0.0, 0.0)];
        Results::new_empty(vec![1.0, 2.0, 3.0], detectors, vec![1], orders)
    }

    fn spectrum(value: f64, error: f64) -> Vec<AttenuationEstimate> {
        vec![AttenuationEstimate { value, error }; 3]
    }

    #[test]
    fn spectra_land_in_their_rows() {
        let mut results = results(vec![1]);
        results.set_spectrum(0, 0, &spectrum(0.5, 0.01));
        results.finish(false);
        assert_eq!(results.attenuation[[0, 2]], 0.5);
        assert_eq!(results.errors[[0, 1]], 0.01);
        // masked row untouched
        assert!(results.attenuation.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn summed_orders_add_in_quadrature() {
        let mut results = results(vec![1, 2]);
        results.set_spectrum(0, 0, &spectrum(0.5, 0.03));
        results.set_spectrum(1, 0, &spectrum(0.1, 0.04));
        results.finish(true);
        assert!((results.attenuation[[0, 0]] - 0.6).abs() < 1e-12);
        assert!((results.errors[[0, 0]] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn unsummed_reports_highest_order() {
        let mut results = results(vec![1, 2]);
        results.set_spectrum(0, 0, &spectrum(0.5, 0.03));
        results.set_spectrum(1, 0, &spectrum(0.1, 0.04));
        results.finish(false);
        assert_eq!(results.attenuation[[0, 0]], 0.1);
    }
}

/// Factors of one scattering order, indexed (spectrum, wavelength).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub order: usize,
    pub attenuation: Array2<f64>,
    pub errors: Array2<f64>,
}

/// Quadrature factors, indexed (spectrum, wavelength).
#[derive(Debug, Clone, PartialEq)]
pub struct QuadratureResult {
    pub a1: Array2<f64>,
    pub a2: Option<Array2<f64>>,
}

impl QuadratureResult {
    pub fn new_empty(spectra: usize, wavelengths: usize, double: bool) -> Self {
        Self {
            a1: Array2::zeros((spectra, wavelengths)),
            a2: double.then(|| Array2::zeros((spectra, wavelengths))),
        }
    }

    pub fn set_spectrum(&mut self, spectrum: usize, estimates: &[QuadratureEstimate]) {
        for (k, estimate) in estimates.iter().enumerate() {
            self.a1[[spectrum, k]] = estimate.a1;
            if let (Some(a2), Some(value)) = (self.a2.as_mut(), estimate.a2) {
                a2[[spectrum, k]] = value;
            }
        }
    }
}

/// Everything a correction run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Results {
    pub wavelengths: Vec<f64>,
    pub detectors: Vec<Point3<f64>>,
    pub masked: Vec<usize>,
    pub orders: Vec<OrderResult>,
    pub attenuation: Array2<f64>, // reported factors: the sum of the orders, or the configured order
    pub errors: Array2<f64>,
    pub quadrature: Option<QuadratureResult>,
    pub stats: InteractionStatistics,
    pub seed: u64,
}

impl Results {
    /// Creates zeroed results for every spectrum and order.
    pub fn new_empty(
        wavelengths: Vec<f64>,
        detectors: Vec<Point3<f64>>,
        masked: Vec<usize>,
        orders: Vec<usize>,
    ) -> Self {
        let shape = (detectors.len(), wavelengths.len());
        Self {
            orders: orders
                .into_iter()
                .map(|order| OrderResult {
                    order,
                    attenuation: Array2::zeros(shape),
                    errors: Array2::zeros(shape),
                })
                .collect(),
            attenuation: Array2::zeros(shape),
            errors: Array2::zeros(shape),
            quadrature: None,
            stats: InteractionStatistics::new(),
            seed: 0,
            wavelengths,
            detectors,
            masked,
        }
    }

    pub fn num_spectra(&self) -> usize {
        self.detectors.len()
    }

    pub fn set_spectrum(&mut self, order_index: usize, spectrum: usize, estimates: &[AttenuationEstimate]) {
        let target = &mut self.orders[order_index];
        for (k, estimate) in estimates.iter().enumerate() {
            target.attenuation[[spectrum, k]] = estimate.value;
            target.errors[[spectrum, k]] = estimate.error;
        }
    }

    /// Fills the reported arrays, summing the orders with their errors added
    /// in quadrature, or copying the last order.
    pub fn finish(&mut self, sum_orders: bool) {
        if sum_orders {
            self.attenuation.fill(0.0);
            self.errors.fill(0.0);
            for order in &self.orders {
                self.attenuation += &order.attenuation;
                Zip::from(&mut self.errors)
                    .and(&order.errors)
                    .for_each(|total, &e| *total += e * e);
            }
            self.errors.mapv_inplace(f64::sqrt);
        } else if let Some(order) = self.orders.last() {
            self.attenuation = order.attenuation.clone();
            self.errors = order.errors.clone();
        }
    }

    pub fn print(&self) {
        println!("{}", self.stats);
        let Some(reference) = (0..self.num_spectra()).find(|i| !self.masked.contains(i)) else {
            println!("Every spectrum is masked");
            return;
        };
        let p = self.detectors[reference];
        println!(
            "Spectrum {} at ({:.3}, {:.3}, {:.3}) m:",
            reference, p.x, p.y, p.z
        );
        for (k, wavelength) in self.wavelengths.iter().enumerate() {
            println!(
                "  {:>8.4} A  {:.6} +/- {:.6}",
                wavelength,
                self.attenuation[[reference, k]],
                self.errors[[reference, k]]
            );
        }
    }
}
