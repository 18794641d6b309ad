//! Angular distribution of scattering events.
//!
//! Scattering is either isotropic, or weighted by a tabulated structure
//! factor S(Q). With a table, the wavelength dependent scattering cross
//! section follows from integrating Q S(Q) over the kinematically allowed
//! range, and the momentum transfer of each event can be importance sampled
//! from the inverse cumulative distribution of Q S(Q).

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;


/// Number of cells in a tabulated inverse cumulative distribution of Q.
pub const Q_SAMPLER_POINTS: usize = 1000;

/// Structure factor table as read from the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StructureFactorSettings {
    pub q: Vec<f64>,
    pub s: Vec<f64>,
    #[serde(default)]
    pub importance_sampling: bool,
}

/// S(Q) tabulated on an increasing Q grid, linear between points and held
/// flat outside the table.
#[derive(Debug, Clone, PartialEq)]
struct StructureFactor {
    q: Vec<f64>,
    s: Vec<f64>,
    cumulative: Vec<f64>, // integral of Q S(Q) from zero to each grid point
}

impl StructureFactor {
    fn new(q: Vec<f64>, s: Vec<f64>) -> Result<Self> {
        ensure!(
            q.len() == s.len(),
            "structure_factor: q and s must have the same length ({} vs {})",
            q.len(),
            s.len()
        );
        ensure!(
            q.len() >= 2,
            "structure_factor: at least two points are required, got {}",
            q.len()
        );
        ensure!(q[0] >= 0.0, "structure_factor: q values must be non-negative");
        ensure!(
            q.windows(2).all(|w| w[1] > w[0]),
            "structure_factor: q values must be strictly increasing"
        );
        ensure!(
            s.iter().all(|&v| v > 0.0 && v.is_finite()),
            "structure_factor: s values must be finite and positive"
        );

        let mut cumulative = Vec::with_capacity(q.len());
        cumulative.push(s[0] * q[0] * q[0] / 2.0);
        for i in 1..q.len() {
            let segment = segment_integral(q[i - 1], s[i - 1], q[i], s[i], q[i]);
            cumulative.push(cumulative[i - 1] + segment);
        }

        Ok(Self { q, s, cumulative })
    }

    fn value(&self, q: f64) -> f64 {
        let last = self.q.len() - 1;
        if q <= self.q[0] {
            return self.s[0];
        }
        if q >= self.q[last] {
            return self.s[last];
        }
        let i = self.q.partition_point(|&x| x <= q) - 1;
        let t = (q - self.q[i]) / (self.q[i + 1] - self.q[i]);
        self.s[i] + t * (self.s[i + 1] - self.s[i])
    }

    /// Integral of Q S(Q) from zero to `x`.
    fn integral(&self, x: f64) -> f64 {
        let x = x.max(0.0);
        let last = self.q.len() - 1;
        if x <= self.q[0] {
            return self.s[0] * x * x / 2.0;
        }
        if x >= self.q[last] {
            return self.cumulative[last] + self.s[last] * (x * x - self.q[last] * self.q[last]) / 2.0;
        }
        let i = self.q.partition_point(|&v| v <= x) - 1;
        self.cumulative[i] + segment_integral(self.q[i], self.s[i], self.q[i + 1], self.s[i + 1], x)
    }
}

/// Integral of Q S(Q) from `a` to `x` with S linear between (a, sa) and (b, sb).
fn segment_integral(a: f64, sa: f64, b: f64, sb: f64, x: f64) -> f64 {
    let slope = (sb - sa) / (b - a);
    let square = (x * x - a * a) / 2.0;
    let cube = (x * x * x - a * a * a) / 3.0;
    sa * square + slope * (cube - a * square)
}

/// How scattering events choose their new direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatteringDistribution {
    structure_factor: Option<StructureFactor>,
    importance_sampling: bool,
}

impl ScatteringDistribution {
    pub fn isotropic() -> Self {
        Self {
            structure_factor: None,
            importance_sampling: false,
        }
    }

    pub fn from_table(q: Vec<f64>, s: Vec<f64>, importance_sampling: bool) -> Result<Self> {
        Ok(Self {
            structure_factor: Some(StructureFactor::new(q, s)?),
            importance_sampling,
        })
    }

    pub fn from_settings(settings: Option<&StructureFactorSettings>) -> Result<Self> {
        match settings {
            Some(table) => Self::from_table(
                table.q.clone(),
                table.s.clone(),
                table.importance_sampling,
            ),
            None => Ok(Self::isotropic()),
        }
    }

    pub fn is_isotropic(&self) -> bool {
        self.structure_factor.is_none()
    }

    pub fn s_of_q(&self, q: f64) -> f64 {
        match &self.structure_factor {
            Some(table) => table.value(q),
            None => 1.0,
        }
    }

    /// Ratio of the structure factor weighted cross section to the bound one:
    /// the integral of Q S(Q) over |ki - kf|..ki + kf divided by 2 ki kf.
    pub fn scale(&self, k_inc: f64, k_final: f64) -> f64 {
        match &self.structure_factor {
            Some(table) => {
                let q_min = (k_inc - k_final).abs();
                let q_max = k_inc + k_final;
                (table.integral(q_max) - table.integral(q_min)) / (2.0 * k_inc * k_final)
            }
            None => 1.0,
        }
    }

    /// Inverse CDF sampler for the momentum transfer, only available when
    /// importance sampling against a table was requested.
    pub fn sampler(&self, k_inc: f64, k_final: f64) -> Option<QSampler> {
        match &self.structure_factor {
            Some(table) if self.importance_sampling => QSampler::new(table, k_inc, k_final),
            _ => None,
        }
    }
}

/// Tabulated inverse cumulative distribution of Q S(Q) over one kinematic range.
#[derive(Debug, Clone, PartialEq)]
pub struct QSampler {
    pub k_inc: f64,
    pub k_final: f64,
    q_min: f64,
    step: f64,
    cdf: Vec<f64>, // unnormalised, starts at zero
}

impl QSampler {
    fn new(table: &StructureFactor, k_inc: f64, k_final: f64) -> Option<Self> {
        let q_min = (k_inc - k_final).abs();
        let q_max = k_inc + k_final;
        if !(q_max > q_min) {
            return None;
        }
        let step = (q_max - q_min) / Q_SAMPLER_POINTS as f64;
        let origin = table.integral(q_min);
        let cdf: Vec<f64> = (0..=Q_SAMPLER_POINTS)
            .map(|j| table.integral(q_min + j as f64 * step) - origin)
            .collect();
        if !(cdf[Q_SAMPLER_POINTS] > 0.0) {
            return None;
        }
        Some(Self {
            k_inc,
            k_final,
            q_min,
            step,
            cdf,
        })
    }

    fn total(&self) -> f64 {
        self.cdf[Q_SAMPLER_POINTS]
    }

    /// Maps a uniform deviate in [0, 1) onto a momentum transfer.
    pub fn sample(&self, u: f64) -> f64 {
        let target = u.clamp(0.0, 1.0) * self.total();
        let j = (self.cdf.partition_point(|&c| c <= target))
            .saturating_sub(1)
            .min(Q_SAMPLER_POINTS - 1);
        let width = self.cdf[j + 1] - self.cdf[j];
        let fraction = if width > 0.0 {
            ((target - self.cdf[j]) / width).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.q_min + (j as f64 + fraction) * self.step
    }

    /// Probability density of [`QSampler::sample`] at `q`.
    pub fn pdf(&self, q: f64) -> f64 {
        let x = (q - self.q_min) / self.step;
        if x < 0.0 || x > Q_SAMPLER_POINTS as f64 {
            return 0.0;
        }
        let j = (x.floor() as usize).min(Q_SAMPLER_POINTS - 1);
        (self.cdf[j + 1] - self.cdf[j]) / (self.step * self.total())
    }

    /// Density per unit solid angle of the direction implied by `q`.
    pub fn direction_density(&self, q: f64) -> f64 {
        if q <= 0.0 {
            return f64::INFINITY;
        }
        self.pdf(q) * self.k_inc * self.k_final / (2.0 * PI * q)
    }
}
