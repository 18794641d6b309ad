//! The combined sample and environment geometry seen by the transport engine.
//!
//! Components are stored in precedence order: the sample first, then the
//! environment layers. Where shapes overlap the earlier component owns the
//! space. The volume is read-only during a run and shared by every worker;
//! all per-event state lives in [`Track`].

use std::fmt;

use anyhow::{bail, Context, Result};
use log::debug;
use nalgebra::{Point3, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::beam::{Beam, BeamProfile};
use crate::containment::AABB;
use crate::geom::{subtract_intervals, Interval, Shape};
use crate::material::Material;
use crate::settings::{INTERVAL_TOLERANCE, PROBE_GRID};
use crate::statistics::InteractionStatistics;
use crate::track::{Deflection, EventFailure, Leg, Link, Track};

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cylinder(radius: f64) -> Shape {
        Shape::Cylinder {
            base: Point3::new(0.0, -0.02, 0.0),
            axis: Vector3::y(),
            radius,
            height: 0.04,
        }
    }

    fn vanadium_volume(region: ScatterRegion) -> InteractionVolume {
        let sample = Component::new("sample", cylinder(0.006), Material::new("V", 0.072, 5.1, 5.08));
        let can = Component::new(
            "can",
            Shape::HollowCylinder {
                base: Point3::new(0.0, -0.03, 0.0),
                axis: Vector3::y(),
                inner_radius: 0.007,
                outer_radius: 0.008,
                height: 0.06,
            },
            Material::new("Al", 0.0602, 1.503, 0.231),
        );
        InteractionVolume::new(vec![sample, can], None, region, 100).unwrap()
    }

    #[test]
    fn earlier_component_takes_precedence() {
        let sample = Component::new("sample", cylinder(0.006), Material::new("V", 0.072, 5.1, 5.08));
        let overlap = Component::new("overlap", cylinder(0.01), Material::new("Al", 0.06, 1.5, 0.23));
        let volume =
            InteractionVolume::new(vec![sample, overlap], None, ScatterRegion::Sample, 10).unwrap();
        let links = volume.intercept(&Point3::new(0.0, 0.0, -1.0), &Vector3::z());
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].component, 1);
        assert_eq!(links[1].component, 0);
        assert!((links[1].length() - 0.012).abs() < 1e-12);
        assert_eq!(links[2].component, 1);
        assert!((links[0].length() - 0.004).abs() < 1e-12);
    }

    #[test]
    fn region_selects_components() {
        let volume = vanadium_volume(ScatterRegion::Environment);
        assert!(!volume.in_region(0));
        assert!(volume.in_region(1));
        let links = volume.intercept(&Point3::new(0.0, 0.0, -1.0), &Vector3::z());
        // can wall, sample, can wall
        assert!((volume.region_length(&links) - 0.002).abs() < 1e-12);
    }

    #[test]
    fn start_point_lies_in_sample() {
        let volume = vanadium_volume(ScatterRegion::Sample);
        let coefficients = volume.coefficients(2.0, 1.0);
        let mut rng = StdRng::seed_from_u64(11);
        let mut stats = InteractionStatistics::new();
        for _ in 0..200 {
            let track = volume.start_point(&mut rng, &coefficients, &mut stats).unwrap();
            assert_eq!(track.legs[0].component, 0);
            assert!(volume.components[0].shape.contains(&track.position));
            assert!(track.weight > 0.0 && track.weight.is_finite());
            assert!(track.chord > 0.0 && track.chord <= 0.012 + 1e-12);
        }
        assert!(stats.start_attempts >= 200);
    }

    #[test]
    fn first_leg_weight_is_escape_probability_over_mu() {
        // sample only: exp(-tau) / q(s) reduces to (1 - exp(-mu c)) / mu
        let sample = Component::new("sample", cylinder(0.006), Material::new("V", 0.072, 5.1, 5.08));
        let volume = InteractionVolume::new(vec![sample], None, ScatterRegion::Sample, 10).unwrap();
        let coefficients = volume.coefficients(2.0, 1.0);
        let mu = coefficients.attenuation[0];
        let mut rng = StdRng::seed_from_u64(5);
        let mut stats = InteractionStatistics::new();
        let track = volume.start_point(&mut rng, &coefficients, &mut stats).unwrap();
        let expected = -(-mu * track.chord).exp_m1() / mu;
        assert!((track.weight - expected).abs() < 1e-12 * expected.max(1.0));
    }

    #[test]
    fn transparent_sample_samples_uniformly() {
        let sample = Component::new("sample", cylinder(0.006), Material::new("void", 0.0, 0.0, 0.0));
        let volume = InteractionVolume::new(vec![sample], None, ScatterRegion::Sample, 10).unwrap();
        let coefficients = volume.coefficients(2.0, 1.0);
        let mut rng = StdRng::seed_from_u64(9);
        let mut stats = InteractionStatistics::new();
        let track = volume.start_point(&mut rng, &coefficients, &mut stats).unwrap();
        assert_eq!(track.weight, track.chord);
    }

    #[test]
    fn beam_that_misses_sample_is_rejected() {
        let sample = Component::new("sample", cylinder(0.006), Material::new("V", 0.072, 5.1, 5.08));
        let beam = BeamProfile::Rectangular {
            width: 0.001,
            height: 0.001,
        };
        let mut shifted = sample.clone();
        shifted.shape = Shape::Sphere {
            centre: Point3::new(0.5, 0.0, 0.0),
            radius: 0.01,
        };
        let err = InteractionVolume::new(vec![shifted], Some(&beam), ScatterRegion::Sample, 10);
        assert!(err.is_err());
    }
}

/// A named body of one material.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Component {
    pub name: String,
    pub shape: Shape,
    pub material: Material,
}

impl Component {
    pub fn new(name: &str, shape: Shape, material: Material) -> Self {
        Self {
            name: name.to_string(),
            shape,
            material,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.shape.validate()?;
        self.material.validate()
    }
}

/// Which components may hold scattering points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterRegion {
    #[default]
    Sample,
    Environment,
    SampleAndEnvironment,
}

impl fmt::Display for ScatterRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScatterRegion::Sample => write!(f, "sample"),
            ScatterRegion::Environment => write!(f, "environment"),
            ScatterRegion::SampleAndEnvironment => write!(f, "sample and environment"),
        }
    }
}

/// Macroscopic coefficients of every component at one wavenumber, in 1/m.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub attenuation: Vec<f64>, // total attenuation, scattering plus absorption
    pub scattering: Vec<f64>,  // bound scattering coefficient
}

/// Where a distance sample along a leg landed and how likely it was.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PathSample {
    distance: f64,
    component: usize,
    shift: f64, // 1 / q(s) = exp(shift) * scale, split to keep exp() in range
    scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionVolume {
    pub components: Vec<Component>,
    pub beam: Beam,
    pub region: ScatterRegion,
    pub max_scatter_attempts: usize,
    region_box: AABB,
}

impl InteractionVolume {
    /// Builds the volume, loading and validating every shape and checking that
    /// the beam reaches the sample. Any failure here is a configuration error.
    pub fn new(
        mut components: Vec<Component>,
        beam_profile: Option<&BeamProfile>,
        region: ScatterRegion,
        max_scatter_attempts: usize,
    ) -> Result<Self> {
        if components.is_empty() {
            bail!("the interaction volume needs a sample component");
        }
        for component in components.iter_mut() {
            component
                .shape
                .init()
                .and_then(|_| component.validate())
                .with_context(|| format!("invalid component '{}'", component.name))?;
        }

        let sample_box = components[0].shape.bounding_box();
        let scene_box = components
            .iter()
            .skip(1)
            .fold(sample_box.clone(), |acc, c| acc.union(&c.shape.bounding_box()));
        let region_box = components
            .iter()
            .enumerate()
            .filter(|(i, _)| in_region(region, *i))
            .map(|(_, c)| c.shape.bounding_box())
            .reduce(|a, b| a.union(&b))
            .with_context(|| format!("no components in the '{}' scatter region", region))?;

        let beam = Beam::new(beam_profile, &sample_box, &region_box, &scene_box)?;

        let volume = Self {
            components,
            beam,
            region,
            max_scatter_attempts,
            region_box,
        };

        let probes = volume.beam.probe_rays(PROBE_GRID);
        let hits = probes
            .iter()
            .filter(|ray| !volume.components[0].shape.intercept(&ray.origin, &ray.direction).is_empty())
            .count();
        if hits == 0 {
            bail!(
                "no beam ray reaches the sample '{}'; check the beam profile and sample position",
                volume.components[0].name
            );
        }
        debug!(
            "beam reaches the sample with {} of {} probe rays",
            hits,
            probes.len()
        );

        Ok(volume)
    }

    pub fn in_region(&self, component: usize) -> bool {
        in_region(self.region, component)
    }

    /// Bounding box of the components that may hold scattering points.
    pub fn region_box(&self) -> &AABB {
        &self.region_box
    }

    /// Total volume of the components that may hold scattering points.
    pub fn region_volume(&self) -> f64 {
        self.components
            .iter()
            .enumerate()
            .filter(|(i, _)| self.in_region(*i))
            .map(|(_, c)| c.shape.volume())
            .sum()
    }

    /// The component owning `point`, honouring precedence.
    pub fn component_at(&self, point: &Point3<f64>) -> Option<usize> {
        self.components.iter().position(|c| c.shape.contains(point))
    }

    /// Segments of a ray through all components, ordered by distance. Each
    /// component only keeps the parts not already claimed by an earlier one.
    pub fn intercept(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> Vec<Link> {
        let mut claimed: Vec<Interval> = Vec::new();
        let mut links = Vec::new();
        for (index, component) in self.components.iter().enumerate() {
            let intervals = component.shape.intercept(origin, direction);
            if intervals.is_empty() {
                continue;
            }
            let own = subtract_intervals(intervals.clone(), &claimed);
            links.extend(
                own.into_iter()
                    .filter(|(t0, t1)| t1 - t0 > INTERVAL_TOLERANCE)
                    .map(|(t0, t1)| Link::new(index, t0, t1)),
            );
            claimed.extend(intervals);
        }
        links.sort_by(|a, b| a.entry.total_cmp(&b.entry));
        links
    }

    /// Length of the links that lie in the scatter region.
    pub fn region_length(&self, links: &[Link]) -> f64 {
        links
            .iter()
            .filter(|l| self.in_region(l.component))
            .map(Link::length)
            .sum()
    }

    /// Component coefficients at `wavelength` (Angstrom). `scale` weights the
    /// bound scattering cross section for the attenuation.
    pub fn coefficients(&self, wavelength: f64, scale: f64) -> Coefficients {
        Coefficients {
            attenuation: self
                .components
                .iter()
                .map(|c| c.material.attenuation_coefficient(wavelength, scale))
                .collect(),
            scattering: self
                .components
                .iter()
                .map(|c| c.material.scattering_coefficient(1.0))
                .collect(),
        }
    }

    /// Draws beam rays until one crosses the scatter region, giving up after
    /// `max_scatter_attempts` draws.
    pub fn generate_initial_track<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        stats: &mut InteractionStatistics,
    ) -> Option<Track> {
        for _ in 0..self.max_scatter_attempts {
            stats.start_attempts += 1;
            let Some(ray) = self.beam.generate_ray(rng) else {
                continue;
            };
            let links = self.intercept(&ray.origin, &ray.direction);
            let chord = self.region_length(&links);
            if chord > INTERVAL_TOLERANCE {
                return Some(Track::new(&ray, links, chord));
            }
        }
        None
    }

    /// Generates the incident leg of an event and places the first scattering
    /// point on it. The track weight becomes exp(-tau(s)) / q(s).
    pub fn start_point<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        coefficients: &Coefficients,
        stats: &mut InteractionStatistics,
    ) -> Result<Track, EventFailure> {
        let mut track = self
            .generate_initial_track(rng, stats)
            .ok_or(EventFailure::NoStartPoint)?;
        let sample = self
            .sample_distance(&track.links, coefficients, rng)?
            .ok_or(EventFailure::NoStartPoint)?;
        self.advance(&mut track, sample, coefficients, None);
        Ok(track)
    }

    /// Traces the track along its current direction, samples the next
    /// scattering point and updates weight and position. Returns the component
    /// of the new point, or `None` when the direction finds no scattering
    /// material (the walk escapes).
    pub fn update_weight_and_position<R: Rng + ?Sized>(
        &self,
        track: &mut Track,
        coefficients: &Coefficients,
        rng: &mut R,
        deflection: Deflection,
    ) -> Result<Option<usize>, EventFailure> {
        track.origin = track.position;
        track.links = self.intercept(&track.position, &track.direction);
        match self.sample_distance(&track.links, coefficients, rng)? {
            Some(sample) => {
                self.advance(track, sample, coefficients, Some(deflection));
                Ok(Some(sample.component))
            }
            None => {
                track.escape();
                Ok(None)
            }
        }
    }

    /// Moves the track to a sampled point, applying exp(-tau(s)) / q(s).
    fn advance(
        &self,
        track: &mut Track,
        sample: PathSample,
        coefficients: &Coefficients,
        deflection: Option<Deflection>,
    ) {
        let tau = optical_depth(&track.links, &coefficients.attenuation, sample.distance);
        track.scale_weight((sample.shift - tau).exp() * sample.scale);
        track.path_length += inside_length(&track.links, sample.distance);
        track.position = track.origin + track.direction * sample.distance;
        track.legs.push(Leg {
            links: std::mem::take(&mut track.links),
            distance: sample.distance,
            component: sample.component,
            shift: sample.shift,
            scale: sample.scale,
            end: track.position,
            deflection,
        });
    }

    /// Samples a distance along `links` restricted to the scatter region. With a
    /// single attenuation coefficient across the region the distance follows an
    /// exponential truncated to the region chord; otherwise it is uniform.
    fn sample_distance<R: Rng + ?Sized>(
        &self,
        links: &[Link],
        coefficients: &Coefficients,
        rng: &mut R,
    ) -> Result<Option<PathSample>, EventFailure> {
        let region: Vec<&Link> = links.iter().filter(|l| self.in_region(l.component)).collect();
        let length: f64 = region.iter().map(|l| l.length()).sum();
        if !(length > INTERVAL_TOLERANCE) {
            return Ok(None);
        }

        let mu = coefficients.attenuation[region[0].component];
        let homogeneous = region
            .iter()
            .all(|l| coefficients.attenuation[l.component] == mu);
        let xi: f64 = rng.random();

        let (position, shift, scale) = if homogeneous && mu > 0.0 {
            let escape = -(-mu * length).exp_m1();
            let target = -(-xi * escape).ln_1p();
            (target / mu, target, escape / mu)
        } else {
            (xi * length, 0.0, length)
        };

        let mut remaining = position;
        for link in &region {
            if remaining <= link.length() {
                let distance = link.entry + remaining;
                if !(distance >= 0.0) || !distance.is_finite() {
                    return Err(EventFailure::InvalidDistance);
                }
                return Ok(Some(PathSample {
                    distance,
                    component: link.component,
                    shift,
                    scale,
                }));
            }
            remaining -= link.length();
        }
        // rounding pushed the point past the last link
        let last = region[region.len() - 1];
        if !position.is_finite() {
            return Err(EventFailure::InvalidDistance);
        }
        Ok(Some(PathSample {
            distance: last.exit,
            component: last.component,
            shift,
            scale,
        }))
    }
}

fn in_region(region: ScatterRegion, component: usize) -> bool {
    match region {
        ScatterRegion::Sample => component == 0,
        ScatterRegion::Environment => component > 0,
        ScatterRegion::SampleAndEnvironment => true,
    }
}

/// Optical depth accumulated along `links` up to `distance`.
pub fn optical_depth(links: &[Link], attenuation: &[f64], distance: f64) -> f64 {
    links
        .iter()
        .map(|l| attenuation[l.component] * l.length_before(distance))
        .sum()
}

/// Distance travelled inside components up to `distance`.
pub fn inside_length(links: &[Link], distance: f64) -> f64 {
    links.iter().map(|l| l.length_before(distance)).sum()
}
