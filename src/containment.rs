//! Axis-aligned bounding boxes.
//!
//! Bounding boxes restrict where beam rays are started and where volume
//! elements are laid out, and give a cheap rejection test before the exact
//! shape queries.

use nalgebra::{Point3, Vector3};

use crate::geom::{slab_interval, Interval};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_covers_both() {
        let a = AABB::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let b = AABB::new(Point3::new(0.5, -1.0, 0.5), Point3::new(2.0, 0.5, 0.8));
        let union = a.union(&b);
        assert_eq!(union.min, Point3::new(0.0, -1.0, 0.0));
        assert_eq!(union.max, Point3::new(2.0, 1.0, 1.0));
        assert!(union.contains(&Point3::new(1.5, -0.5, 0.9)));
    }

    #[test]
    fn ray_through_box() {
        let aabb = AABB::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let (t0, t1) = aabb
            .intercept(&Point3::new(0.0, 0.0, -5.0), &Vector3::z())
            .unwrap();
        assert!((t0 - 4.0).abs() < 1e-12 && (t1 - 6.0).abs() < 1e-12);
        assert!(aabb
            .intercept(&Point3::new(3.0, 0.0, -5.0), &Vector3::z())
            .is_none());
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct AABB {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl AABB {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &AABB) -> AABB {
        AABB {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn contains(&self, point: &Point3<f64>) -> bool {
        (0..3).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }

    pub fn centre(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// Parametric range along the ray that lies inside the box (may start
    /// behind the origin).
    pub fn intercept(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> Option<Interval> {
        let mut range = (f64::NEG_INFINITY, f64::INFINITY);
        for i in 0..3 {
            let (t0, t1) = slab_interval(origin[i], direction[i], self.min[i], self.max[i])?;
            range = (range.0.max(t0), range.1.min(t1));
            if range.1 < range.0 {
                return None;
            }
        }
        Some(range)
    }
}
