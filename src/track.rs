use std::fmt;

use nalgebra::{Point3, Vector3};

use crate::beam::Ray;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_overlap_is_clipped() {
        let link = Link::new(0, 1.0, 3.0);
        assert_eq!(link.length(), 2.0);
        assert_eq!(link.length_before(0.5), 0.0);
        assert_eq!(link.length_before(2.0), 1.0);
        assert_eq!(link.length_before(10.0), 2.0);
    }

    #[test]
    fn new_track_starts_at_ray_origin() {
        let ray = Ray {
            origin: Point3::new(0.0, 0.0, -1.0),
            direction: Vector3::z(),
        };
        let track = Track::new(&ray, vec![Link::new(0, 0.5, 1.5)], 1.0);
        assert_eq!(track.position, ray.origin);
        assert_eq!(track.weight, 1.0);
        assert_eq!(track.chord, 1.0);
        assert!(track.legs.is_empty());
    }
}

/// A segment of a ray inside one component, as distances from the ray origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub component: usize,
    pub entry: f64,
    pub exit: f64,
}

impl Link {
    pub fn new(component: usize, entry: f64, exit: f64) -> Self {
        Self {
            component,
            entry,
            exit,
        }
    }

    pub fn length(&self) -> f64 {
        self.exit - self.entry
    }

    /// Length of the part of the segment closer to the origin than `distance`.
    pub fn length_before(&self, distance: f64) -> f64 {
        (distance.min(self.exit) - self.entry).max(0.0)
    }
}

/// The scattering event that turned a walk onto a new leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deflection {
    pub cos_theta: f64,         // cosine of the angle between old and new direction
    pub direction_density: f64, // density per steradian the new direction was drawn with
}

/// One straight leg of a walk, ending at a scattering point.
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub links: Vec<Link>,
    pub distance: f64,    // from the leg origin to the scattering point
    pub component: usize, // component holding the scattering point
    pub shift: f64,       // the inverse sampling density is exp(shift) * scale
    pub scale: f64,
    pub end: Point3<f64>,
    pub deflection: Option<Deflection>, // none for the incident leg
}

/// The leg from the last scattering point to the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Exit {
    pub links: Vec<Link>,
    pub distance: f64,
    pub cos_theta: f64,        // final scattering angle
    pub single_cos_theta: f64, // angle a single scatter at the first point would have
}

/// Per-event state of a random walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub origin: Point3<f64>,       // start of the current leg
    pub position: Point3<f64>,
    pub direction: Vector3<f64>,
    pub links: Vec<Link>,          // segments of the current leg
    pub path_length: f64,          // distance travelled inside components
    pub weight: f64,
    pub chord: f64,                // scatter region chord of the incident ray
    pub legs: Vec<Leg>,
    pub exit: Option<Exit>,
    pub escaped: bool,
}

impl Track {
    pub fn new(ray: &Ray, links: Vec<Link>, chord: f64) -> Self {
        Self {
            origin: ray.origin,
            position: ray.origin,
            direction: ray.direction,
            links,
            path_length: 0.0,
            weight: 1.0,
            chord,
            legs: Vec::new(),
            exit: None,
            escaped: false,
        }
    }

    /// Number of scattering points reached so far.
    pub fn scatters(&self) -> usize {
        self.legs.len()
    }

    /// Marks the walk as lost: no scattering material along the sampled direction.
    pub fn escape(&mut self) {
        self.escaped = true;
        self.weight = 0.0;
    }

    /// Multiplies the weight, clamping underflow and invalid products to zero.
    pub fn scale_weight(&mut self, factor: f64) {
        self.weight = (self.weight * factor).max(0.0);
        if !self.weight.is_finite() {
            self.weight = 0.0;
        }
    }
}

/// Why an event produced no estimate. Failed events are counted and left
/// out of the average, unlike escapes which contribute a zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFailure {
    NoStartPoint,    // no beam ray crossed the scatter region within the attempt limit
    InvalidDistance, // a sampled distance was negative or not a number
}

impl fmt::Display for EventFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFailure::NoStartPoint => write!(f, "no start point"),
            EventFailure::InvalidDistance => write!(f, "invalid sampled distance"),
        }
    }
}
