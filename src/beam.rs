//! Incident beam geometry.
//!
//! The beam travels along +z. Its cross-section is a rectangle or a disc in
//! the xy plane, and rays are started on a plane upstream of every component.
//! Only the part of the cross-section that overlaps the scatter region's
//! bounding box (the active region) is sampled, so no rays are wasted on
//! flux that can never scatter.

use anyhow::{bail, ensure, Result};
use nalgebra::{Point3, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::containment::AABB;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unit_box() -> AABB {
        AABB::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn default_beam_covers_sample_cross_section() {
        let beam = Beam::new(None, &unit_box(), &unit_box(), &unit_box()).unwrap();
        assert!((beam.area() - 4.0).abs() < 1e-12);
        assert!((beam.active_area() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn narrow_beam_restricts_active_region() {
        let profile = BeamProfile::Rectangular {
            width: 0.5,
            height: 10.0,
        };
        let beam = Beam::new(Some(&profile), &unit_box(), &unit_box(), &unit_box()).unwrap();
        assert!((beam.active_area() - 1.0).abs() < 1e-12);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let ray = beam.generate_ray(&mut rng).unwrap();
            assert!(ray.origin.x.abs() <= 0.25);
            assert!(ray.origin.y.abs() <= 1.0);
            assert!(ray.origin.z < -1.0);
            assert_eq!(ray.direction, Vector3::z());
        }
    }

    #[test]
    fn circular_beam_rejects_corners() {
        let profile = BeamProfile::Circular { radius: 1.0 };
        let beam = Beam::new(Some(&profile), &unit_box(), &unit_box(), &unit_box()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let accepted = (0..10_000)
            .filter_map(|_| beam.generate_ray(&mut rng))
            .inspect(|ray| assert!(ray.origin.x.hypot(ray.origin.y) <= 1.0))
            .count();
        // pi / 4 of the bounding square lies inside the disc
        let fraction = accepted as f64 / 10_000.0;
        assert!((fraction - std::f64::consts::FRAC_PI_4).abs() < 0.02, "{}", fraction);
    }

    #[test]
    fn beam_missing_region_is_an_error() {
        let profile = BeamProfile::Circular { radius: 0.1 };
        let far = AABB::new(Point3::new(5.0, 5.0, -1.0), Point3::new(6.0, 6.0, 1.0));
        assert!(Beam::new(Some(&profile), &far, &far, &far).is_err());
    }
}

/// Cross-section of the incident beam, centred on the beam axis.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BeamProfile {
    Rectangular { width: f64, height: f64 },
    Circular { radius: f64 },
}

impl BeamProfile {
    pub fn validate(&self) -> Result<()> {
        match self {
            BeamProfile::Rectangular { width, height } => {
                ensure!(
                    *width > 0.0 && *height > 0.0,
                    "beam width and height must be positive, got {} x {}",
                    width,
                    height
                );
            }
            BeamProfile::Circular { radius } => {
                ensure!(*radius > 0.0, "beam radius must be positive, got {}", radius);
            }
        }
        Ok(())
    }

    /// Half widths of the profile's bounding rectangle in x and y.
    fn half_extent(&self) -> (f64, f64) {
        match self {
            BeamProfile::Rectangular { width, height } => (width / 2.0, height / 2.0),
            BeamProfile::Circular { radius } => (*radius, *radius),
        }
    }

    fn area(&self) -> f64 {
        match self {
            BeamProfile::Rectangular { width, height } => width * height,
            BeamProfile::Circular { radius } => std::f64::consts::PI * radius * radius,
        }
    }
}

/// A straight line with a unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    pub profile: BeamProfile,
    pub centre: (f64, f64), // x, y of the beam axis
    start_z: f64,           // plane on which rays are started
    active_min: (f64, f64), // active region, lower corner in xy
    active_max: (f64, f64), // active region, upper corner in xy
}

impl Beam {
    /// Builds the beam. Without a profile the beam is a rectangle matching the
    /// sample's bounding box cross-section. The active region is the overlap of
    /// the profile with `region_box`; `scene_box` bounds every component so
    /// rays start upstream of all of them.
    pub fn new(
        profile: Option<&BeamProfile>,
        sample_box: &AABB,
        region_box: &AABB,
        scene_box: &AABB,
    ) -> Result<Self> {
        let (profile, centre) = match profile {
            Some(profile) => {
                profile.validate()?;
                (profile.clone(), (0.0, 0.0))
            }
            None => {
                let size = sample_box.size();
                let centre = sample_box.centre();
                (
                    BeamProfile::Rectangular {
                        width: size.x,
                        height: size.y,
                    },
                    (centre.x, centre.y),
                )
            }
        };

        let (hx, hy) = profile.half_extent();
        let active_min = (
            (centre.0 - hx).max(region_box.min.x),
            (centre.1 - hy).max(region_box.min.y),
        );
        let active_max = (
            (centre.0 + hx).min(region_box.max.x),
            (centre.1 + hy).min(region_box.max.y),
        );
        if active_max.0 <= active_min.0 || active_max.1 <= active_min.1 {
            bail!("beam profile {:?} does not overlap the scatter region", profile);
        }

        // one extent upstream keeps the start plane clear of every surface
        let start_z = scene_box.min.z - scene_box.size().z.max(1.0);

        Ok(Self {
            profile,
            centre,
            start_z,
            active_min,
            active_max,
        })
    }

    pub fn direction(&self) -> Vector3<f64> {
        Vector3::z()
    }

    /// Area of the full beam cross-section.
    pub fn area(&self) -> f64 {
        self.profile.area()
    }

    /// Area of the rectangle rays are drawn from.
    pub fn active_area(&self) -> f64 {
        (self.active_max.0 - self.active_min.0) * (self.active_max.1 - self.active_min.1)
    }

    fn in_profile(&self, x: f64, y: f64) -> bool {
        match self.profile {
            BeamProfile::Rectangular { .. } => true,
            BeamProfile::Circular { radius } => {
                (x - self.centre.0).hypot(y - self.centre.1) <= radius
            }
        }
    }

    fn ray_at(&self, x: f64, y: f64) -> Ray {
        Ray {
            origin: Point3::new(x, y, self.start_z),
            direction: self.direction(),
        }
    }

    /// Draws a ray uniformly over the active region. Returns `None` when the
    /// draw falls outside a circular profile; callers count that as a failed
    /// attempt and draw again.
    pub fn generate_ray<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Ray> {
        let x = self.active_min.0 + rng.random::<f64>() * (self.active_max.0 - self.active_min.0);
        let y = self.active_min.1 + rng.random::<f64>() * (self.active_max.1 - self.active_min.1);
        self.in_profile(x, y).then(|| self.ray_at(x, y))
    }

    /// Deterministic grid of rays over the active region, `n` per side.
    pub fn probe_rays(&self, n: usize) -> Vec<Ray> {
        let step_x = (self.active_max.0 - self.active_min.0) / n as f64;
        let step_y = (self.active_max.1 - self.active_min.1) / n as f64;
        (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| {
                (
                    self.active_min.0 + (i as f64 + 0.5) * step_x,
                    self.active_min.1 + (j as f64 + 0.5) * step_y,
                )
            })
            .filter(|&(x, y)| self.in_profile(x, y))
            .map(|(x, y)| self.ray_at(x, y))
            .collect()
    }

    /// Whether a point's projection along the beam falls inside the profile.
    pub fn illuminates(&self, point: &Point3<f64>) -> bool {
        let (hx, hy) = self.profile.half_extent();
        (point.x - self.centre.0).abs() <= hx
            && (point.y - self.centre.1).abs() <= hy
            && self.in_profile(point.x, point.y)
    }
}
