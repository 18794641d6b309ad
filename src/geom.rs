//! Solid bodies and ray intersection.
//!
//! Every shape answers the same question: over which distance intervals is a
//! ray from `origin` along `direction` inside me? Intervals are clipped to the
//! forward half of the ray, so a ray starting inside a shape gets an interval
//! beginning at zero. Lengths are metres.

use std::collections::HashMap;
use std::f64::consts::PI;

use anyhow::{anyhow, bail, ensure, Context, Result};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::containment::AABB;
use crate::settings::{INTERVAL_TOLERANCE, PARALLEL_EPSILON};


/// A parametric distance range along a ray.
pub type Interval = (f64, f64);

fn default_mesh_scale() -> f64 {
    1.0
}

/// A triangular facet of a closed mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Triangle {
    pub vertices: [Point3<f64>; 3],
}

impl Triangle {
    /// Moller-Trumbore intersection, returning the signed distance along the ray.
    fn intersect(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> Option<f64> {
        let [v0, v1, v2] = &self.vertices;
        let e1 = v1 - v0;
        let e2 = v2 - v0;
        let p = direction.cross(&e2);
        let det = e1.dot(&p);
        if det.abs() < PARALLEL_EPSILON {
            return None;
        }
        let inv = 1.0 / det;
        let s = origin - v0;
        let u = s.dot(&p) * inv;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(&e1);
        let v = direction.dot(&q) * inv;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        Some(e2.dot(&q) * inv)
    }

    fn area(&self) -> f64 {
        let [v0, v1, v2] = &self.vertices;
        (v1 - v0).cross(&(v2 - v0)).norm() / 2.0
    }
}

/// A solid body that can be traced through.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    /// Capped cylinder standing on `base` along `axis`.
    Cylinder {
        base: Point3<f64>,
        axis: Vector3<f64>,
        radius: f64,
        height: f64,
    },
    /// Annular can: a cylinder with a coaxial hole of the same height.
    HollowCylinder {
        base: Point3<f64>,
        axis: Vector3<f64>,
        inner_radius: f64,
        outer_radius: f64,
        height: f64,
    },
    Sphere {
        centre: Point3<f64>,
        radius: f64,
    },
    SphericalShell {
        centre: Point3<f64>,
        inner_radius: f64,
        outer_radius: f64,
    },
    /// Axis-aligned box with full edge lengths `size`.
    Cuboid {
        centre: Point3<f64>,
        size: Vector3<f64>,
    },
    /// Closed triangle mesh read from a Wavefront OBJ file.
    Mesh {
        path: String,
        #[serde(default = "default_mesh_scale")]
        scale: f64,
        #[serde(skip)]
        triangles: Vec<Triangle>,
    },
}

impl Shape {
    /// Builds a mesh shape from explicit triangles.
    pub fn mesh_from_triangles(triangles: Vec<[Point3<f64>; 3]>) -> Result<Shape> {
        let triangles: Vec<Triangle> = triangles
            .into_iter()
            .map(|vertices| Triangle { vertices })
            .collect();
        check_closed(&triangles)?;
        let shape = Shape::Mesh {
            path: String::new(),
            scale: 1.0,
            triangles,
        };
        shape.validate()?;
        Ok(shape)
    }

    /// Loads any external data the shape refers to. A no-op for analytic shapes.
    pub fn init(&mut self) -> Result<()> {
        if let Shape::Mesh {
            path,
            scale,
            triangles,
        } = self
        {
            if triangles.is_empty() {
                *triangles = load_obj_triangles(path, *scale)?;
                check_closed(triangles).with_context(|| format!("mesh '{}'", path))?;
            }
        }
        Ok(())
    }

    /// Rejects shapes that cannot be traced: zero or negative dimensions,
    /// inverted shells, empty or flat meshes.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: f64| -> Result<()> {
            ensure!(
                value > 0.0 && value.is_finite(),
                "{} must be finite and positive, got {}",
                name,
                value
            );
            Ok(())
        };
        match self {
            Shape::Cylinder {
                axis,
                radius,
                height,
                ..
            } => {
                positive("radius", *radius)?;
                positive("height", *height)?;
                positive("axis length", axis.norm())?;
            }
            Shape::HollowCylinder {
                axis,
                inner_radius,
                outer_radius,
                height,
                ..
            } => {
                positive("inner_radius", *inner_radius)?;
                positive("outer_radius", *outer_radius)?;
                positive("height", *height)?;
                positive("axis length", axis.norm())?;
                ensure!(
                    inner_radius < outer_radius,
                    "inner_radius ({}) must be smaller than outer_radius ({})",
                    inner_radius,
                    outer_radius
                );
            }
            Shape::Sphere { radius, .. } => positive("radius", *radius)?,
            Shape::SphericalShell {
                inner_radius,
                outer_radius,
                ..
            } => {
                positive("inner_radius", *inner_radius)?;
                positive("outer_radius", *outer_radius)?;
                ensure!(
                    inner_radius < outer_radius,
                    "inner_radius ({}) must be smaller than outer_radius ({})",
                    inner_radius,
                    outer_radius
                );
            }
            Shape::Cuboid { size, .. } => {
                positive("size.x", size.x)?;
                positive("size.y", size.y)?;
                positive("size.z", size.z)?;
            }
            Shape::Mesh {
                path, triangles, ..
            } => {
                ensure!(
                    !triangles.is_empty(),
                    "mesh '{}' has no triangles (was it loaded?)",
                    path
                );
                if let Some(i) = triangles.iter().position(|t| t.area() <= PARALLEL_EPSILON) {
                    bail!("mesh '{}' has a degenerate triangle at index {}", path, i);
                }
                positive("mesh volume", self.volume())?;
            }
        }
        Ok(())
    }

    /// Forward intervals of the ray that lie inside the shape, sorted and
    /// disjoint. Slivers shorter than the interval tolerance are dropped.
    pub fn intercept(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> Vec<Interval> {
        let raw = match self {
            Shape::Cylinder {
                base,
                axis,
                radius,
                height,
            } => cylinder_interval(origin, direction, base, axis, *radius, *height)
                .into_iter()
                .collect(),
            Shape::HollowCylinder {
                base,
                axis,
                inner_radius,
                outer_radius,
                height,
            } => match cylinder_interval(origin, direction, base, axis, *outer_radius, *height) {
                Some(outer) => match cylinder_interval(
                    origin,
                    direction,
                    base,
                    axis,
                    *inner_radius,
                    *height,
                ) {
                    Some(inner) => subtract_interval(outer, inner),
                    None => vec![outer],
                },
                None => Vec::new(),
            },
            Shape::Sphere { centre, radius } => {
                sphere_interval(origin, direction, centre, *radius)
                    .into_iter()
                    .collect()
            }
            Shape::SphericalShell {
                centre,
                inner_radius,
                outer_radius,
            } => match sphere_interval(origin, direction, centre, *outer_radius) {
                Some(outer) => match sphere_interval(origin, direction, centre, *inner_radius) {
                    Some(inner) => subtract_interval(outer, inner),
                    None => vec![outer],
                },
                None => Vec::new(),
            },
            Shape::Cuboid { centre, size } => {
                let half = size / 2.0;
                let lo = centre - half;
                let hi = centre + half;
                AABB::new(lo, hi)
                    .intercept(origin, direction)
                    .into_iter()
                    .collect()
            }
            Shape::Mesh { triangles, .. } => mesh_intervals(triangles, origin, direction),
        };
        clip_forward(raw)
    }

    /// Whether a point lies inside (or on the surface of) the shape.
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        match self {
            Shape::Cylinder {
                base,
                axis,
                radius,
                height,
            } => {
                let (along, radial) = cylinder_coordinates(point, base, axis);
                along >= 0.0 && along <= *height && radial <= *radius
            }
            Shape::HollowCylinder {
                base,
                axis,
                inner_radius,
                outer_radius,
                height,
            } => {
                let (along, radial) = cylinder_coordinates(point, base, axis);
                along >= 0.0 && along <= *height && radial <= *outer_radius && radial >= *inner_radius
            }
            Shape::Sphere { centre, radius } => (point - centre).norm() <= *radius,
            Shape::SphericalShell {
                centre,
                inner_radius,
                outer_radius,
            } => {
                let r = (point - centre).norm();
                r >= *inner_radius && r <= *outer_radius
            }
            Shape::Cuboid { centre, size } => {
                (0..3).all(|i| (point[i] - centre[i]).abs() <= size[i] / 2.0)
            }
            Shape::Mesh { triangles, .. } => {
                // skew direction keeps the parity ray away from mesh edges
                let direction = Vector3::new(0.577_03, 0.577_41, 0.577_91).normalize();
                mesh_intervals(triangles, point, &direction)
                    .first()
                    .map(|(t0, t1)| *t0 <= 0.0 && *t1 > 0.0)
                    .unwrap_or(false)
            }
        }
    }

    pub fn bounding_box(&self) -> AABB {
        match self {
            Shape::Cylinder {
                base,
                axis,
                radius,
                height,
            }
            | Shape::HollowCylinder {
                base,
                axis,
                outer_radius: radius,
                height,
                ..
            } => {
                let axis = axis.normalize();
                let top = base + axis * *height;
                let extent = Vector3::from_fn(|i, _| radius * (1.0 - axis[i] * axis[i]).max(0.0).sqrt());
                AABB::new(base.inf(&top) - extent, base.sup(&top) + extent)
            }
            Shape::Sphere { centre, radius }
            | Shape::SphericalShell {
                centre,
                outer_radius: radius,
                ..
            } => {
                let extent = Vector3::repeat(*radius);
                AABB::new(centre - extent, centre + extent)
            }
            Shape::Cuboid { centre, size } => AABB::new(centre - size / 2.0, centre + size / 2.0),
            Shape::Mesh { triangles, .. } => {
                let mut vertices = triangles.iter().flat_map(|t| t.vertices.iter());
                let first = vertices.next().copied().unwrap_or_else(Point3::origin);
                let (min, max) = vertices.fold((first, first), |(lo, hi), v| (lo.inf(v), hi.sup(v)));
                AABB::new(min, max)
            }
        }
    }

    pub fn volume(&self) -> f64 {
        match self {
            Shape::Cylinder { radius, height, .. } => PI * radius * radius * height,
            Shape::HollowCylinder {
                inner_radius,
                outer_radius,
                height,
                ..
            } => PI * (outer_radius * outer_radius - inner_radius * inner_radius) * height,
            Shape::Sphere { radius, .. } => 4.0 / 3.0 * PI * radius.powi(3),
            Shape::SphericalShell {
                inner_radius,
                outer_radius,
                ..
            } => 4.0 / 3.0 * PI * (outer_radius.powi(3) - inner_radius.powi(3)),
            Shape::Cuboid { size, .. } => size.x * size.y * size.z,
            Shape::Mesh { triangles, .. } => {
                // divergence theorem over signed tetrahedra from the origin
                let signed: f64 = triangles
                    .iter()
                    .map(|t| {
                        let [a, b, c] = &t.vertices;
                        a.coords.dot(&b.coords.cross(&c.coords))
                    })
                    .sum();
                signed.abs() / 6.0
            }
        }
    }
}

/// Distance along the axis and distance from the axis of a point.
fn cylinder_coordinates(point: &Point3<f64>, base: &Point3<f64>, axis: &Vector3<f64>) -> (f64, f64) {
    let axis = axis.normalize();
    let w = point - base;
    let along = w.dot(&axis);
    (along, (w - axis * along).norm())
}

/// Parameters t of the ray for which `w + t d` lies within [lo, hi] along one axis.
pub fn slab_interval(w: f64, d: f64, lo: f64, hi: f64) -> Option<Interval> {
    if d.abs() < PARALLEL_EPSILON {
        return if w >= lo && w <= hi {
            Some((f64::NEG_INFINITY, f64::INFINITY))
        } else {
            None
        };
    }
    let t0 = (lo - w) / d;
    let t1 = (hi - w) / d;
    Some((t0.min(t1), t0.max(t1)))
}

/// Parameters t for which a t^2 + b t + c <= 0, with a >= 0.
fn quadratic_interval(a: f64, b: f64, c: f64) -> Option<Interval> {
    if a < PARALLEL_EPSILON {
        return if c <= 0.0 {
            Some((f64::NEG_INFINITY, f64::INFINITY))
        } else {
            None
        };
    }
    let discriminant = b * b - 4.0 * a * c;
    if discriminant <= 0.0 {
        return None;
    }
    // numerically stable pair of roots
    let q = -0.5 * (b + b.signum() * discriminant.sqrt());
    let t1 = q / a;
    let t2 = c / q;
    Some((t1.min(t2), t1.max(t2)))
}

fn cylinder_interval(
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    base: &Point3<f64>,
    axis: &Vector3<f64>,
    radius: f64,
    height: f64,
) -> Option<Interval> {
    let axis = axis.normalize();
    let w = origin - base;
    let w_along = w.dot(&axis);
    let d_along = direction.dot(&axis);
    let w_perp = w - axis * w_along;
    let d_perp = direction - axis * d_along;
    let radial = quadratic_interval(
        d_perp.norm_squared(),
        2.0 * w_perp.dot(&d_perp),
        w_perp.norm_squared() - radius * radius,
    )?;
    let axial = slab_interval(w_along, d_along, 0.0, height)?;
    let range = (radial.0.max(axial.0), radial.1.min(axial.1));
    (range.1 > range.0).then_some(range)
}

fn sphere_interval(
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    centre: &Point3<f64>,
    radius: f64,
) -> Option<Interval> {
    let w = origin - centre;
    quadratic_interval(
        direction.norm_squared(),
        2.0 * w.dot(direction),
        w.norm_squared() - radius * radius,
    )
}

/// `outer` with `inner` removed, as zero, one or two intervals.
pub fn subtract_interval(outer: Interval, inner: Interval) -> Vec<Interval> {
    let mut pieces = Vec::with_capacity(2);
    if inner.0 > outer.0 {
        pieces.push((outer.0, inner.0.min(outer.1)));
    }
    if inner.1 < outer.1 {
        pieces.push((inner.1.max(outer.0), outer.1));
    }
    pieces.retain(|(a, b)| b > a);
    pieces
}

/// Removes from each interval of `intervals` everything covered by `claimed`.
pub fn subtract_intervals(intervals: Vec<Interval>, claimed: &[Interval]) -> Vec<Interval> {
    claimed.iter().fold(intervals, |remaining, &hole| {
        remaining
            .into_iter()
            .flat_map(|interval| {
                if hole.1 <= interval.0 || hole.0 >= interval.1 {
                    vec![interval]
                } else {
                    subtract_interval(interval, hole)
                }
            })
            .collect()
    })
}

/// Clips intervals to t >= 0, drops slivers and sorts them.
fn clip_forward(intervals: Vec<Interval>) -> Vec<Interval> {
    let mut clipped: Vec<Interval> = intervals
        .into_iter()
        .map(|(t0, t1)| (t0.max(0.0), t1))
        .filter(|(t0, t1)| t1 - t0 > INTERVAL_TOLERANCE && t1.is_finite())
        .collect();
    clipped.sort_by(|a, b| a.0.total_cmp(&b.0));
    clipped
}

/// Inside intervals of a closed mesh from the parity of boundary crossings.
fn mesh_intervals(triangles: &[Triangle], origin: &Point3<f64>, direction: &Vector3<f64>) -> Vec<Interval> {
    let mut hits: Vec<f64> = triangles
        .iter()
        .filter_map(|t| t.intersect(origin, direction))
        .collect();
    hits.sort_by(|a, b| a.total_cmp(b));
    // a ray through a shared edge reports the same crossing twice
    hits.dedup_by(|a, b| (*a - *b).abs() < INTERVAL_TOLERANCE);

    let behind = hits.iter().filter(|&&t| t < 0.0).count();
    let mut inside = behind % 2 == 1;
    let mut entry = 0.0;
    let mut intervals = Vec::new();
    for &t in hits.iter().filter(|&&t| t >= 0.0) {
        if inside {
            intervals.push((entry, t));
        } else {
            entry = t;
        }
        inside = !inside;
    }
    intervals
}

fn load_obj_triangles(path: &str, scale: f64) -> Result<Vec<Triangle>> {
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ..Default::default()
    };
    let (models, _) = tobj::load_obj(path, &options)
        .map_err(|e| anyhow!("failed to load OBJ file '{}': {}", path, e))?;

    let mut triangles = Vec::new();
    for model in &models {
        let mesh = &model.mesh;
        let vertex = |i: u32| {
            let i = i as usize;
            Point3::new(
                mesh.positions[3 * i] as f64 * scale,
                mesh.positions[3 * i + 1] as f64 * scale,
                mesh.positions[3 * i + 2] as f64 * scale,
            )
        };
        for face in mesh.indices.chunks_exact(3) {
            triangles.push(Triangle {
                vertices: [vertex(face[0]), vertex(face[1]), vertex(face[2])],
            });
        }
    }
    ensure!(!triangles.is_empty(), "OBJ file '{}' contains no faces", path);
    Ok(triangles)
}

/// Every edge of a closed surface is shared by exactly two triangles.
fn check_closed(triangles: &[Triangle]) -> Result<()> {
    let key = |p: &Point3<f64>| {
        (
            (p.x / INTERVAL_TOLERANCE).round() as i64,
            (p.y / INTERVAL_TOLERANCE).round() as i64,
            (p.z / INTERVAL_TOLERANCE).round() as i64,
        )
    };
    let mut edges: HashMap<_, usize> = HashMap::new();
    for triangle in triangles {
        for i in 0..3 {
            let a = key(&triangle.vertices[i]);
            let b = key(&triangle.vertices[(i + 1) % 3]);
            let edge = if a < b { (a, b) } else { (b, a) };
            *edges.entry(edge).or_insert(0) += 1;
        }
    }
    let open = edges.values().filter(|&&count| count != 2).count();
    ensure!(
        open == 0,
        "mesh is not closed: {} edges are not shared by exactly two faces",
        open
    );
    Ok(())
}
