//! Discovery of propagation paths between two points.
//!
//! A [`Tracer`] borrows the spatial index and answers pure queries, so a
//! single index can be traced from many threads at once. Three mechanisms are
//! searched for:
//!
//! - a direct line of sight,
//! - specular reflections off single triangles, found by mirroring the
//!   transmitter across each candidate's plane,
//! - knife-edge diffraction over a chain of silhouette edges, found by
//!   sweeping rays upward from both ends until they clear the obstruction.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::f32::consts::FRAC_PI_2;

use crate::geom::Ray;
use crate::settings::{
    DIFFRACTION_MAX_ITERATIONS, EDGE_CLEARANCE, EDGE_DEDUP_DISTANCE, EDGE_MERGE_DISTANCE,
    EDGE_RECT_TOLERANCE, EDGE_REFINE_PASSES, EDGE_SCAN_STEP_DEG, RAYCAST_MINIMUM_DISTANCE,
    REFLECTION_EPSILON, SILHOUETTE_STEP_DEG, SILHOUETTE_THRESHOLD,
};
use crate::tree::SpatialIndex;


/// One propagation mechanism found between a transmitter and a receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Unobstructed line of sight.
    Direct,
    /// One point per reflecting triangle.
    Reflect(Vec<Point3<f32>>),
    /// Ordered edge points from the transmitter side to the receiver side.
    EdgeDiffraction(Vec<Point3<f32>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Direct,
    Reflected,
    Diffracted,
}

/// A straight piece of a traced path, for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawableSegment {
    pub start: Point3<f32>,
    pub end: Point3<f32>,
    pub kind: SegmentKind,
}

/// Breaks the geometry of each record into straight segments.
pub fn drawable_segments(
    tx: &Point3<f32>,
    rx: &Point3<f32>,
    records: &[Record],
) -> Vec<DrawableSegment> {
    let segment = |start: &Point3<f32>, end: &Point3<f32>, kind| DrawableSegment {
        start: *start,
        end: *end,
        kind,
    };

    let mut segments = Vec::new();
    for record in records {
        match record {
            Record::Direct => segments.push(segment(tx, rx, SegmentKind::Direct)),
            Record::Reflect(points) => {
                for p in points {
                    segments.push(segment(tx, p, SegmentKind::Reflected));
                    segments.push(segment(p, rx, SegmentKind::Reflected));
                }
            }
            Record::EdgeDiffraction(edges) => {
                let chain: Vec<&Point3<f32>> = std::iter::once(tx)
                    .chain(edges.iter())
                    .chain(std::iter::once(rx))
                    .collect();
                segments.extend(
                    chain
                        .windows(2)
                        .map(|w| segment(w[0], w[1], SegmentKind::Diffracted)),
                );
            }
        }
    }
    segments
}

/// Path queries against a spatial index.
#[derive(Debug, Clone, Copy)]
pub struct Tracer<'a> {
    index: &'a SpatialIndex,
}

impl<'a> Tracer<'a> {
    pub fn new(index: &'a SpatialIndex) -> Self {
        Self { index }
    }

    /// Every mechanism connecting `a` to `b`, computing reflection candidates
    /// on the fly.
    pub fn trace_paths(&self, a: &Point3<f32>, b: &Point3<f32>) -> Vec<Record> {
        let candidates = self.reflection_candidates(a, b);
        self.trace_paths_among(a, b, &candidates)
    }

    /// Every mechanism connecting `a` to `b`, trying reflections only off the
    /// given triangles. A cached visible set of either endpoint is a valid
    /// candidate list since every reflection is validated afterwards.
    pub fn trace_paths_among(
        &self,
        a: &Point3<f32>,
        b: &Point3<f32>,
        candidates: &[usize],
    ) -> Vec<Record> {
        let mut records = Vec::new();

        if self.is_direct_hit(a, b) {
            records.push(Record::Direct);
        }

        let reflections = self.find_reflection_among(a, b, candidates.iter().copied());
        if !reflections.is_empty() {
            records.push(Record::Reflect(reflections));
        }

        let edges = self.find_diffraction(a, b);
        if !edges.is_empty() {
            records.push(Record::EdgeDiffraction(edges));
        }

        records
    }

    /// True when nothing in the scene lies strictly between `a` and `b`.
    pub fn is_direct_hit(&self, a: &Point3<f32>, b: &Point3<f32>) -> bool {
        let distance = (b - a).norm();
        if distance < RAYCAST_MINIMUM_DISTANCE {
            return true;
        }
        match self.index.closest_hit(&Ray::towards(a, b)) {
            Some(hit) => hit.distance > distance,
            None => true,
        }
    }

    /// Triangles seen first by rays cast from `point` on a regular
    /// azimuth/elevation grid.
    pub fn visible_triangles(&self, point: &Point3<f32>) -> BTreeSet<usize> {
        let origin = *point;
        let azimuth_steps = (360.0 / SILHOUETTE_STEP_DEG).round() as usize;
        let elevation_steps = (180.0 / SILHOUETTE_STEP_DEG).round() as usize;

        (0..=elevation_steps)
            .into_par_iter()
            .flat_map_iter(|i| {
                let elevation = (-90.0 + i as f32 * SILHOUETTE_STEP_DEG).to_radians();
                (0..azimuth_steps).filter_map(move |j| {
                    let azimuth = (j as f32 * SILHOUETTE_STEP_DEG).to_radians();
                    let direction = Vector3::new(
                        elevation.cos() * azimuth.cos(),
                        elevation.sin(),
                        elevation.cos() * azimuth.sin(),
                    );
                    self.index
                        .closest_hit(&Ray::new(origin, direction))
                        .map(|hit| hit.triangle)
                })
            })
            .collect()
    }

    /// Visible set of `point` when the mesh is large enough for the
    /// silhouette filter to pay off, `None` otherwise.
    pub fn candidate_set(&self, point: &Point3<f32>) -> Option<BTreeSet<usize>> {
        (self.index.len() > SILHOUETTE_THRESHOLD).then(|| self.visible_triangles(point))
    }

    /// Reflection candidates for paths with one end fixed at `point`: its
    /// visible set on large meshes, every triangle otherwise.
    pub fn candidate_list(&self, point: &Point3<f32>) -> Vec<usize> {
        match self.candidate_set(point) {
            Some(visible) => visible.into_iter().collect(),
            None => (0..self.index.len()).collect(),
        }
    }

    /// Triangles worth testing as reflectors between `a` and `b`.
    pub fn reflection_candidates(&self, a: &Point3<f32>, b: &Point3<f32>) -> Vec<usize> {
        match (self.candidate_set(a), self.candidate_set(b)) {
            (Some(from_a), Some(from_b)) => from_a.intersection(&from_b).copied().collect(),
            _ => (0..self.index.len()).collect(),
        }
    }

    /// Reflection points off any triangle of the scene.
    pub fn find_reflection(&self, a: &Point3<f32>, b: &Point3<f32>) -> Vec<Point3<f32>> {
        let candidates = self.reflection_candidates(a, b);
        self.find_reflection_among(a, b, candidates)
    }

    pub fn find_reflection_among(
        &self,
        a: &Point3<f32>,
        b: &Point3<f32>,
        candidates: impl IntoIterator<Item = usize>,
    ) -> Vec<Point3<f32>> {
        candidates
            .into_iter()
            .filter_map(|id| self.reflect_off(a, b, id))
            .collect()
    }

    /// Specular reflection point on triangle `id`, if the path `a -> point -> b`
    /// exists and is unobstructed.
    pub fn reflect_off(&self, a: &Point3<f32>, b: &Point3<f32>, id: usize) -> Option<Point3<f32>> {
        let triangle = self.index.triangle(id);
        if triangle.normal == Vector3::zeros() {
            return None;
        }

        let side_a = triangle.signed_distance(a);
        let side_b = triangle.signed_distance(b);
        if side_a.abs() < RAYCAST_MINIMUM_DISTANCE || side_a * side_b <= 0.0 {
            return None;
        }

        let mirrored = triangle.mirror(a);
        let ray = Ray::towards(&mirrored, b);
        let limit = (b - mirrored).norm();

        let hit = self
            .index
            .all_hits(&ray)
            .into_iter()
            .find(|hit| hit.triangle == id)?;
        if hit.distance > limit {
            return None;
        }

        let point = ray.at(hit.distance + REFLECTION_EPSILON);
        (self.is_direct_hit(&point, a) && self.is_direct_hit(&point, b)).then_some(point)
    }

    /// Sweeps rays from `from` upward through the vertical half-plane facing
    /// `toward`, starting at the direct line, and returns the point just above
    /// the last obstruction hit inside the horizontal rectangle spanned by the
    /// two points.
    ///
    /// `None` when the direct line is not obstructed within the rectangle, or
    /// when no ray up to the zenith gets past the obstruction.
    pub fn find_edge(&self, from: &Point3<f32>, toward: &Point3<f32>) -> Option<Point3<f32>> {
        let offset = toward - from;
        let horizontal = Vector3::new(offset.x, 0.0, offset.z);
        let distance = horizontal.norm();
        if distance < RAYCAST_MINIMUM_DISTANCE {
            return None;
        }
        let heading = horizontal / distance;

        let (x_min, x_max) = (
            from.x.min(toward.x) - EDGE_RECT_TOLERANCE,
            from.x.max(toward.x) + EDGE_RECT_TOLERANCE,
        );
        let (z_min, z_max) = (
            from.z.min(toward.z) - EDGE_RECT_TOLERANCE,
            from.z.max(toward.z) + EDGE_RECT_TOLERANCE,
        );

        let probe = |elevation: f32| -> Option<Point3<f32>> {
            let direction = heading * elevation.cos() + Vector3::y() * elevation.sin();
            let ray = Ray::new(*from, direction);
            let hit = self.index.closest_hit(&ray)?;
            let p = ray.at(hit.distance);
            ((x_min..=x_max).contains(&p.x) && (z_min..=z_max).contains(&p.z)).then_some(p)
        };

        let step = EDGE_SCAN_STEP_DEG.to_radians();
        let mut elevation = offset.y.atan2(distance);
        let mut last = probe(elevation)?;
        let mut clear = elevation;
        let mut blocked = None;

        while elevation < FRAC_PI_2 {
            elevation = (elevation + step).min(FRAC_PI_2);
            match probe(elevation) {
                Some(p) => {
                    last = p;
                    clear = elevation;
                }
                None => {
                    blocked = Some(elevation);
                    break;
                }
            }
        }

        // bisect between the last obstructed ray and the first free one
        let mut free = blocked?;
        for _ in 0..EDGE_REFINE_PASSES {
            let mid = 0.5 * (clear + free);
            match probe(mid) {
                Some(p) => {
                    last = p;
                    clear = mid;
                }
                None => free = mid,
            }
        }

        Some(last + Vector3::y() * EDGE_CLEARANCE)
    }

    /// Chain of diffraction edges from `a` to `b`, empty when `a` sees `b`
    /// or when the search does not converge.
    pub fn find_diffraction(&self, a: &Point3<f32>, b: &Point3<f32>) -> Vec<Point3<f32>> {
        let mut near_a = Vec::new();
        let mut near_b = Vec::new();
        let (mut from, mut to) = (*a, *b);
        let mut converged = false;

        for _ in 0..DIFFRACTION_MAX_ITERATIONS {
            if self.is_direct_hit(&from, &to) {
                converged = true;
                break;
            }

            let (Some(e1), Some(e2)) = (self.find_edge(&from, &to), self.find_edge(&to, &from))
            else {
                break;
            };

            if (e1 - e2).norm() < EDGE_MERGE_DISTANCE {
                near_a.push(nalgebra::center(&e1, &e2));
                converged = true;
                break;
            }

            near_a.push(e1);
            near_b.push(e2);
            if self.is_direct_hit(&e1, &e2) {
                converged = true;
                break;
            }
            (from, to) = (e1, e2);
        }

        if !converged || near_a.is_empty() {
            if !converged {
                log::trace!("diffraction search from {} to {} did not converge", a, b);
            }
            return Vec::new();
        }

        near_a.extend(near_b.into_iter().rev());
        self.clean_edge_points(a, b, near_a)
    }

    /// Merges near-duplicate edges, orders them from `a` to `b` and keeps only
    /// the edges the path cannot shortcut. Returns an empty chain when the
    /// surviving edges do not connect `a` to `b` with clear segments.
    pub fn clean_edge_points(
        &self,
        a: &Point3<f32>,
        b: &Point3<f32>,
        edges: Vec<Point3<f32>>,
    ) -> Vec<Point3<f32>> {
        // running (sum, count) per cluster
        let mut clusters: Vec<(Vector3<f32>, f32)> = Vec::new();
        for edge in edges {
            let close = clusters
                .iter_mut()
                .find(|(sum, count)| (sum / *count - edge.coords).norm() <= EDGE_DEDUP_DISTANCE);
            match close {
                Some((sum, count)) => {
                    *sum += edge.coords;
                    *count += 1.0;
                }
                None => clusters.push((edge.coords, 1.0)),
            }
        }
        let mut edges: Vec<Point3<f32>> = clusters
            .into_iter()
            .map(|(sum, count)| Point3::from(sum / count))
            .collect();

        let heading = Vector3::new(b.x - a.x, 0.0, b.z - a.z);
        edges.sort_by(|p, q| {
            (p - a)
                .dot(&heading)
                .total_cmp(&(q - a).dot(&heading))
        });

        // from the current point, jump to the farthest edge it can see
        let mut kept = Vec::new();
        let mut current = *a;
        let mut next = 0;
        while next < edges.len() && !self.is_direct_hit(&current, b) {
            let Some(j) = (next..edges.len())
                .rev()
                .find(|&j| self.is_direct_hit(&current, &edges[j]))
            else {
                return Vec::new();
            };
            kept.push(edges[j]);
            current = edges[j];
            next = j + 1;
        }

        let clear = std::iter::once(a)
            .chain(kept.iter())
            .chain(std::iter::once(b))
            .collect::<Vec<_>>()
            .windows(2)
            .all(|w| self.is_direct_hit(w[0], w[1]));

        if kept.is_empty() || !clear {
            return Vec::new();
        }
        kept
    }
}
