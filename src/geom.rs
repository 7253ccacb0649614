//! Scene geometry: triangles, rays, bounding boxes and the ray–triangle test.
//!
//! All coordinates are in scene units with `y` as the vertical axis, so the
//! horizontal plane is spanned by `x` and `z`.

use anyhow::{Context, Result};
use nalgebra::{Point3, Vector3};
use std::path::Path;

use crate::settings::{PARALLEL_EPSILON, RAYCAST_MINIMUM_DISTANCE};


/// A triangle of the scene mesh, with its unit normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Point3<f32>; 3],
    pub normal: Vector3<f32>,
}

impl Triangle {
    /// Builds a triangle, deriving the normal from the winding order.
    /// Zero-area triangles get a zero normal.
    pub fn new(v0: Point3<f32>, v1: Point3<f32>, v2: Point3<f32>) -> Self {
        let normal = (v1 - v0)
            .cross(&(v2 - v0))
            .try_normalize(f32::EPSILON)
            .unwrap_or_else(Vector3::zeros);

        Self {
            vertices: [v0, v1, v2],
            normal,
        }
    }

    pub fn centroid(&self) -> Point3<f32> {
        let [a, b, c] = self.vertices;
        Point3::from((a.coords + b.coords + c.coords) / 3.0)
    }

    /// Signed distance of a point from the plane of the triangle.
    pub fn signed_distance(&self, point: &Point3<f32>) -> f32 {
        self.normal.dot(&(point - self.vertices[0]))
    }

    /// Mirror image of a point across the plane of the triangle.
    pub fn mirror(&self, point: &Point3<f32>) -> Point3<f32> {
        point - self.normal * (2.0 * self.signed_distance(point))
    }

    /// Smallest and largest vertex coordinate along an axis.
    pub fn extent(&self, axis: usize) -> (f32, f32) {
        self.vertices
            .iter()
            .map(|v| v[axis])
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| {
                (lo.min(x), hi.max(x))
            })
    }
}

/// A half-line with a unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point3<f32>,
    pub direction: Vector3<f32>,
}

impl Ray {
    /// Creates a ray, normalizing the direction.
    pub fn new(origin: Point3<f32>, direction: Vector3<f32>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Ray from `from` aimed at `to`. The points must not coincide.
    pub fn towards(from: &Point3<f32>, to: &Point3<f32>) -> Self {
        Self::new(*from, to - from)
    }

    pub fn at(&self, t: f32) -> Point3<f32> {
        self.origin + self.direction * t
    }
}

/// Möller–Trumbore ray–triangle intersection.
///
/// Returns the distance along the ray to the hit, or `None` when the ray is
/// parallel to the triangle, misses it, or hits behind the origin.
pub fn intersect_ray_triangle(ray: &Ray, triangle: &Triangle) -> Option<f32> {
    let [v0, v1, v2] = triangle.vertices;
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let p = ray.direction.cross(&edge2);
    let det = edge1.dot(&p);
    if det.abs() < PARALLEL_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;

    let s = ray.origin - v0;
    let u = s.dot(&p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&edge1);
    let v = ray.direction.dot(&q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(&q) * inv_det;
    (t > RAYCAST_MINIMUM_DISTANCE).then_some(t)
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    pub fn new(min: Point3<f32>, max: Point3<f32>) -> Self {
        Self { min, max }
    }

    /// Tight box around the triangles grown by `padding` on every side, or
    /// `None` for an empty slice.
    pub fn from_triangles(triangles: &[Triangle], padding: f32) -> Option<Self> {
        Self::from_points(triangles.iter().flat_map(|t| t.vertices), padding)
    }

    /// Tight box around the points grown by `padding`, or `None` when there are none.
    pub fn from_points(points: impl IntoIterator<Item = Point3<f32>>, padding: f32) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let (min, max) = points.fold((first, first), |(min, max), v| (min.inf(&v), max.sup(&v)));
        let pad = Vector3::repeat(padding);
        Some(Self::new(min - pad, max + pad))
    }

    /// Distance along the ray at which it enters the box, clamped to zero
    /// when the origin is inside, or `None` if the ray misses it.
    pub fn entry_distance(&self, ray: &Ray) -> Option<f32> {
        let mut t_min = 0.0_f32;
        let mut t_max = f32::INFINITY;

        for axis in 0..3 {
            let origin = ray.origin[axis];
            let direction = ray.direction[axis];

            if direction.abs() < PARALLEL_EPSILON {
                if origin < self.min[axis] || origin > self.max[axis] {
                    return None;
                }
                continue;
            }

            let inv = 1.0 / direction;
            let mut t0 = (self.min[axis] - origin) * inv;
            let mut t1 = (self.max[axis] - origin) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }

            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }

        Some(t_min)
    }
}

/// A static triangulated environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub triangles: Vec<Triangle>,
}

impl Scene {
    pub fn new(triangles: Vec<Triangle>) -> Self {
        Self { triangles }
    }

    /// Loads a Wavefront OBJ file, triangulating polygonal faces.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };
        let (models, _) = tobj::load_obj(path, &options)
            .with_context(|| format!("failed to load OBJ file {}", path.display()))?;

        let mut triangles = Vec::new();
        for model in &models {
            let mesh = &model.mesh;
            let vertex = |i: u32| {
                let i = i as usize * 3;
                Point3::new(
                    mesh.positions[i],
                    mesh.positions[i + 1],
                    mesh.positions[i + 2],
                )
            };
            for face in mesh.indices.chunks_exact(3) {
                triangles.push(Triangle::new(
                    vertex(face[0]),
                    vertex(face[1]),
                    vertex(face[2]),
                ));
            }
        }

        log::info!(
            "loaded {} triangles from {} models in {}",
            triangles.len(),
            models.len(),
            path.display()
        );

        Ok(Self::new(triangles))
    }

    /// Bounding box of the whole scene, `None` when it has no triangles.
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_triangles(&self.triangles, 0.0)
    }
}
