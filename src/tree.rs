//! Spatial index over the scene triangles.
//!
//! A binary tree of axis-aligned boxes. The split axis cycles x, y, z with
//! depth and each split happens at the mean vertex coordinate of the node's
//! triangles. Triangles straddling the split plane are referenced from both
//! children; a split that duplicates too many triangles is abandoned.
//!
//! The tree only accelerates queries: [`SpatialIndex::closest_hit`] and
//! [`SpatialIndex::all_hits`] return exactly what a linear scan over every
//! triangle would.

use itertools::Itertools;
use nalgebra::Point3;

use crate::geom::{intersect_ray_triangle, Aabb, Ray, Triangle};
use crate::settings::{BOUNDS_PADDING, MAX_TREE_DEPTH, SPLIT_THRESHOLD};

#[cfg(test)]
mod tests {

    use super::*;
    use nalgebra::Vector3;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_point(rng: &mut StdRng, extent: f32) -> Point3<f32> {
        Point3::new(
            rng.random_range(-extent..extent),
            rng.random_range(-extent..extent),
            rng.random_range(-extent..extent),
        )
    }

    fn random_direction(rng: &mut StdRng) -> Vector3<f32> {
        loop {
            let v = Vector3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            );
            if v.norm() > 0.1 {
                return v;
            }
        }
    }

    fn random_triangles(rng: &mut StdRng, count: usize) -> Vec<Triangle> {
        (0..count)
            .map(|_| {
                let centre = random_point(rng, 50.0);
                let a = centre + random_direction(rng) * 3.0;
                let b = centre + random_direction(rng) * 3.0;
                let c = centre + random_direction(rng) * 3.0;
                Triangle::new(a, b, c)
            })
            .collect()
    }

    fn brute_force_closest(triangles: &[Triangle], ray: &Ray) -> Option<f32> {
        triangles
            .iter()
            .filter_map(|t| intersect_ray_triangle(ray, t))
            .reduce(f32::min)
    }

    fn brute_force_all(triangles: &[Triangle], ray: &Ray) -> Vec<(usize, f32)> {
        let mut hits: Vec<_> = triangles
            .iter()
            .enumerate()
            .filter_map(|(i, t)| intersect_ray_triangle(ray, t).map(|d| (i, d)))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits
    }

    fn check_structure(node: &Node, depth: usize) {
        match node {
            Node::Leaf { triangles, .. } => {
                assert!(!triangles.is_empty());
            }
            Node::Interior { axis, children, .. } => {
                assert_eq!(*axis, depth % 3);
                assert!(depth < MAX_TREE_DEPTH);
                check_structure(&children[0], depth + 1);
                check_structure(&children[1], depth + 1);
            }
        }
    }

    #[test]
    fn empty_index_never_hits() {
        let index = SpatialIndex::build(Vec::new());
        let ray = Ray::new(Point3::origin(), Vector3::x());
        assert!(index.is_empty());
        assert!(index.closest_hit(&ray).is_none());
        assert!(index.all_hits(&ray).is_empty());
    }

    #[test]
    fn large_mesh_is_split() {
        let mut rng = StdRng::seed_from_u64(7);
        let index = SpatialIndex::build(random_triangles(&mut rng, 2000));
        let root = index.root.as_ref().unwrap();
        assert!(matches!(root, Node::Interior { .. }));
        check_structure(root, 0);
    }

    #[test]
    fn small_mesh_stays_a_leaf() {
        let mut rng = StdRng::seed_from_u64(3);
        let index = SpatialIndex::build(random_triangles(&mut rng, SPLIT_THRESHOLD));
        assert!(matches!(index.root, Some(Node::Leaf { .. })));
    }

    #[test]
    fn straddling_split_is_abandoned() {
        // every triangle crosses x = 0, so any x split duplicates all of them
        let triangles: Vec<_> = (0..300)
            .map(|i| {
                let y = i as f32 * 0.1;
                Triangle::new(
                    Point3::new(-10.0, y, 0.0),
                    Point3::new(10.0, y, 0.0),
                    Point3::new(0.0, y + 0.05, 1.0),
                )
            })
            .collect();
        let index = SpatialIndex::build(triangles);
        assert!(matches!(index.root, Some(Node::Leaf { .. })));
    }

    #[test]
    fn closest_hit_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(42);
        let triangles = random_triangles(&mut rng, 3000);
        let index = SpatialIndex::build(triangles.clone());

        let mut hits = 0;
        for _ in 0..2000 {
            let ray = Ray::new(random_point(&mut rng, 60.0), random_direction(&mut rng));
            let expected = brute_force_closest(&triangles, &ray);
            let actual = index.closest_hit(&ray).map(|hit| hit.distance);
            match (expected, actual) {
                (Some(e), Some(a)) => {
                    hits += 1;
                    assert!((e - a).abs() < 1e-5, "expected: {}, actual: {}", e, a)
                }
                (None, None) => {}
                _ => panic!("mismatch: expected {:?}, actual {:?}", expected, actual),
            }
        }
        assert!(hits > 100, "only {} rays hit anything", hits);
    }

    #[test]
    fn all_hits_match_brute_force() {
        let mut rng = StdRng::seed_from_u64(1234);
        let triangles = random_triangles(&mut rng, 3000);
        let index = SpatialIndex::build(triangles.clone());

        for _ in 0..500 {
            let ray = Ray::new(random_point(&mut rng, 60.0), random_direction(&mut rng));
            let hits = index.all_hits(&ray);

            assert!(hits
                .iter()
                .tuple_windows()
                .all(|(a, b)| a.distance <= b.distance));

            let mut actual: Vec<_> = hits.iter().map(|h| (h.triangle, h.distance)).collect();
            actual.sort_by(|a, b| a.0.cmp(&b.0));
            let expected = brute_force_all(&triangles, &ray);

            assert_eq!(actual.len(), expected.len());
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert_eq!(a.0, e.0);
                assert!((a.1 - e.1).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn closest_hit_reports_triangle() {
        let near = Triangle::new(
            Point3::new(-1.0, -1.0, 2.0),
            Point3::new(1.0, -1.0, 2.0),
            Point3::new(0.0, 1.0, 2.0),
        );
        let far = Triangle::new(
            Point3::new(-1.0, -1.0, 5.0),
            Point3::new(1.0, -1.0, 5.0),
            Point3::new(0.0, 1.0, 5.0),
        );
        let index = SpatialIndex::build(vec![far, near]);
        let ray = Ray::new(Point3::origin(), Vector3::z());

        let hit = index.closest_hit(&ray).unwrap();
        assert_eq!(hit.triangle, 1);
        assert!((hit.distance - 2.0).abs() < 1e-5);

        let all = index.all_hits(&ray);
        assert_eq!(all.iter().map(|h| h.triangle).collect::<Vec<_>>(), vec![1, 0]);
    }
}

/// A ray hit: distance along the ray and the index of the triangle hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub distance: f32,
    pub triangle: usize,
}

/// A node of the spatial index. Leaves hold triangle indices, interior nodes
/// own exactly two children.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf {
        bounds: Aabb,
        triangles: Vec<usize>,
    },
    Interior {
        bounds: Aabb,
        axis: usize,
        pivot: f32,
        children: Box<[Node; 2]>,
    },
}

impl Node {
    pub fn bounds(&self) -> &Aabb {
        match self {
            Node::Leaf { bounds, .. } => bounds,
            Node::Interior { bounds, .. } => bounds,
        }
    }
}

/// Immutable acceleration structure over a static triangle set.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialIndex {
    triangles: Vec<Triangle>,
    root: Option<Node>,
}

impl SpatialIndex {
    /// Builds the tree once for a static mesh.
    pub fn build(triangles: Vec<Triangle>) -> Self {
        let ids: Vec<usize> = (0..triangles.len()).collect();
        let root = (!ids.is_empty()).then(|| build_node(&triangles, ids, 0));

        Self { triangles, root }
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn triangle(&self, id: usize) -> &Triangle {
        &self.triangles[id]
    }

    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Nearest intersection along the ray, if any.
    pub fn closest_hit(&self, ray: &Ray) -> Option<Hit> {
        let mut best = None;
        if let Some(root) = &self.root {
            self.closest_in(root, ray, &mut best);
        }
        best
    }

    fn closest_in(&self, node: &Node, ray: &Ray, best: &mut Option<Hit>) {
        let Some(entry) = node.bounds().entry_distance(ray) else {
            return;
        };
        if best.is_some_and(|hit| entry > hit.distance) {
            return;
        }

        match node {
            Node::Leaf { triangles, .. } => {
                for &id in triangles {
                    if let Some(distance) = intersect_ray_triangle(ray, &self.triangles[id]) {
                        if best.map_or(true, |hit| distance < hit.distance) {
                            *best = Some(Hit {
                                distance,
                                triangle: id,
                            });
                        }
                    }
                }
            }
            Node::Interior {
                axis,
                pivot,
                children,
                ..
            } => {
                // visit the side holding the current best hit point first
                let reference = best.map_or(ray.origin, |hit| ray.at(hit.distance));
                let (near, far) = if reference[*axis] <= *pivot {
                    (&children[0], &children[1])
                } else {
                    (&children[1], &children[0])
                };
                self.closest_in(near, ray, best);
                self.closest_in(far, ray, best);
            }
        }
    }

    /// Every triangle the ray intersects, nearest first. Each triangle
    /// appears once even when it is referenced from several leaves.
    pub fn all_hits(&self, ray: &Ray) -> Vec<Hit> {
        let mut hits = Vec::new();
        if let Some(root) = &self.root {
            self.all_in(root, ray, &mut hits);
        }

        hits.into_iter()
            .unique_by(|hit| hit.triangle)
            .sorted_by(|a, b| {
                a.distance
                    .total_cmp(&b.distance)
                    .then(a.triangle.cmp(&b.triangle))
            })
            .collect()
    }

    fn all_in(&self, node: &Node, ray: &Ray, hits: &mut Vec<Hit>) {
        if node.bounds().entry_distance(ray).is_none() {
            return;
        }

        match node {
            Node::Leaf { triangles, .. } => {
                hits.extend(triangles.iter().filter_map(|&id| {
                    intersect_ray_triangle(ray, &self.triangles[id]).map(|distance| Hit {
                        distance,
                        triangle: id,
                    })
                }));
            }
            Node::Interior { children, .. } => {
                self.all_in(&children[0], ray, hits);
                self.all_in(&children[1], ray, hits);
            }
        }
    }
}

fn build_node(triangles: &[Triangle], ids: Vec<usize>, depth: usize) -> Node {
    let bounds = node_bounds(triangles, &ids);

    if ids.len() <= SPLIT_THRESHOLD || depth >= MAX_TREE_DEPTH {
        return Node::Leaf {
            bounds,
            triangles: ids,
        };
    }

    let axis = depth % 3;
    let pivot = ids
        .iter()
        .flat_map(|&id| triangles[id].vertices.iter().map(move |v| v[axis]))
        .sum::<f32>()
        / (3 * ids.len()) as f32;

    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut duplicated = 0;
    for &id in &ids {
        let (lo, hi) = triangles[id].extent(axis);
        let in_left = lo <= pivot;
        let in_right = hi >= pivot;
        if in_left {
            left.push(id);
        }
        if in_right {
            right.push(id);
        }
        if in_left && in_right {
            duplicated += 1;
        }
    }

    if duplicated * 4 >= ids.len() || left.is_empty() || right.is_empty() {
        return Node::Leaf {
            bounds,
            triangles: ids,
        };
    }

    Node::Interior {
        bounds,
        axis,
        pivot,
        children: Box::new([
            build_node(triangles, left, depth + 1),
            build_node(triangles, right, depth + 1),
        ]),
    }
}

fn node_bounds(triangles: &[Triangle], ids: &[usize]) -> Aabb {
    let vertices = ids.iter().flat_map(|&id| triangles[id].vertices);
    // ids is never empty here
    Aabb::from_points(vertices, BOUNDS_PADDING)
        .unwrap_or_else(|| Aabb::new(Point3::origin(), Point3::origin()))
}
