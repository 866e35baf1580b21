use crate::error::{Error, Result};

/// One node of the k-d tree arena.
#[derive(Debug, Clone)]
struct Node {
    /// Splitting axis, `depth % N`.
    axis: usize,
    /// Index of the node's point in `SpatialIndex::points`.
    point: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// A static k-d tree over tagged `N`-dimensional points.
///
/// The tree is built once from a batch of `(tag, coordinate)` pairs and is
/// read-only afterwards, so it can be shared between threads for concurrent
/// queries. Nodes live in a flat arena and refer to their children by index.
///
/// # Examples
/// ```
/// # use starstack::spatial_index::SpatialIndex;
/// let index = SpatialIndex::build(vec![
///     ("a", [0.0, 0.0]),
///     ("b", [10.0, 0.0]),
///     ("c", [0.0, 10.0]),
/// ]).unwrap();
/// assert_eq!(*index.nearest(&[8.0, 1.0]), "b");
/// assert_eq!(index.radial_search(&[1.0, 0.0], 10.0, true), vec![&"a", &"b"]);
/// ```
#[derive(Debug, Clone)]
pub struct SpatialIndex<T, const N: usize> {
    points: Vec<(T, [f64; N])>,
    nodes: Vec<Node>,
    root: usize,
}

impl<T, const N: usize> SpatialIndex<T, N> {
    /// Builds the tree by recursive median splits.
    ///
    /// At depth `d` the points of the current range are sorted along axis
    /// `d % N`; the median becomes the node and the points before and after it
    /// form the left and right subtrees.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if `points` is empty.
    pub fn build(points: Vec<(T, [f64; N])>) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::InvalidArgument(
                "spatial index needs at least one point".into(),
            ));
        }
        let mut order: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = build_range(&points, &mut nodes, &mut order, 0);
        Ok(SpatialIndex {
            points,
            nodes,
            root,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always `false`: an index cannot be built from an empty set.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Tag of the point closest to `query`.
    ///
    /// When several points are at exactly the same distance, which of them is
    /// returned depends on the tree layout.
    pub fn nearest(&self, query: &[f64; N]) -> &T {
        self.nearest_with_distance(query).0
    }

    /// Tag of the point closest to `query` and its Euclidean distance.
    pub fn nearest_with_distance(&self, query: &[f64; N]) -> (&T, f64) {
        let (best, best_d2) = self.nearest_from(self.root, query);
        (&self.points[best].0, best_d2.sqrt())
    }

    /// Tags of every point within `radius` of `query` (boundary included).
    ///
    /// With `sort_by_distance` the tags are ordered nearest first; otherwise
    /// they come in traversal order.
    pub fn radial_search(&self, query: &[f64; N], radius: f64, sort_by_distance: bool) -> Vec<&T> {
        self.radial_search_with_distance(query, radius, sort_by_distance)
            .into_iter()
            .map(|(tag, _)| tag)
            .collect()
    }

    /// Like [`SpatialIndex::radial_search`], paired with each point's distance.
    pub fn radial_search_with_distance(
        &self,
        query: &[f64; N],
        radius: f64,
        sort_by_distance: bool,
    ) -> Vec<(&T, f64)> {
        let mut matches = Vec::new();
        if radius >= 0.0 {
            self.radial_from(self.root, query, radius * radius, &mut matches);
        }
        if sort_by_distance {
            matches.sort_by(|a, b| a.1.total_cmp(&b.1));
        }
        matches
            .into_iter()
            .map(|(point, d2)| (&self.points[point].0, d2.sqrt()))
            .collect()
    }

    fn distance2(&self, point: usize, query: &[f64; N]) -> f64 {
        let coord = &self.points[point].1;
        (0..N).map(|i| (query[i] - coord[i]) * (query[i] - coord[i])).sum()
    }

    /// Squared distance from `query` to the node's splitting plane; a lower
    /// bound for every point on the far side.
    fn partial_distance2(&self, node: &Node, query: &[f64; N]) -> f64 {
        let d = query[node.axis] - self.points[node.point].1[node.axis];
        d * d
    }

    fn sides(&self, node: &Node, query: &[f64; N]) -> (Option<usize>, Option<usize>) {
        if query[node.axis] < self.points[node.point].1[node.axis] {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        }
    }

    /// Returns `(point index, squared distance)` of the best point in the subtree.
    fn nearest_from(&self, node_index: usize, query: &[f64; N]) -> (usize, f64) {
        let node = &self.nodes[node_index];
        let mut best = (node.point, self.distance2(node.point, query));
        let (near, far) = self.sides(node, query);

        if let Some(near) = near {
            let candidate = self.nearest_from(near, query);
            if candidate.1 < best.1 {
                best = candidate;
            }
        }
        if let Some(far) = far {
            if self.partial_distance2(node, query) < best.1 {
                let candidate = self.nearest_from(far, query);
                if candidate.1 < best.1 {
                    best = candidate;
                }
            }
        }
        best
    }

    fn radial_from(&self, node_index: usize, query: &[f64; N], r2: f64, out: &mut Vec<(usize, f64)>) {
        let node = &self.nodes[node_index];
        let d2 = self.distance2(node.point, query);
        if d2 <= r2 {
            out.push((node.point, d2));
        }
        let (near, far) = self.sides(node, query);
        if let Some(near) = near {
            self.radial_from(near, query, r2, out);
        }
        if let Some(far) = far {
            if self.partial_distance2(node, query) <= r2 {
                self.radial_from(far, query, r2, out);
            }
        }
    }
}

fn build_range<T, const N: usize>(
    points: &[(T, [f64; N])],
    nodes: &mut Vec<Node>,
    range: &mut [usize],
    depth: usize,
) -> usize {
    let axis = depth % N;
    range.sort_by(|&a, &b| points[a].1[axis].total_cmp(&points[b].1[axis]));

    let middle = range.len() / 2;
    let median = range[middle];
    let (before, rest) = range.split_at_mut(middle);
    let after = &mut rest[1..];

    let left = (!before.is_empty()).then(|| build_range(points, nodes, before, depth + 1));
    let right = (!after.is_empty()).then(|| build_range(points, nodes, after, depth + 1));
    nodes.push(Node {
        axis,
        point: median,
        left,
        right,
    });
    nodes.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn random_points<const N: usize>(rng: &mut StdRng, count: usize) -> Vec<(usize, [f64; N])> {
        (0..count)
            .map(|i| {
                let mut c = [0.0; N];
                for v in c.iter_mut() {
                    *v = rng.random_range(-100.0..100.0);
                }
                (i, c)
            })
            .collect()
    }

    fn brute_nearest<const N: usize>(points: &[(usize, [f64; N])], q: &[f64; N]) -> f64 {
        points
            .iter()
            .map(|(_, c)| (0..N).map(|i| (c[i] - q[i]).powi(2)).sum::<f64>().sqrt())
            .fold(f64::INFINITY, f64::min)
    }

    #[test]
    fn empty_input_is_rejected() {
        let r = SpatialIndex::<u32, 2>::build(Vec::new());
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn single_point_index() {
        let index = SpatialIndex::build(vec![(7u8, [1.0, 2.0])]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(*index.nearest(&[100.0, -50.0]), 7);
        assert!(index.radial_search(&[100.0, -50.0], 1.0, false).is_empty());
    }

    #[test]
    fn nearest_of_inserted_point_is_itself() {
        let mut rng = StdRng::seed_from_u64(11);
        let points = random_points::<2>(&mut rng, 500);
        let index = SpatialIndex::build(points.clone()).unwrap();
        for (tag, c) in &points {
            let (found, d) = index.nearest_with_distance(c);
            assert_eq!(found, tag);
            assert_eq!(d, 0.0);
        }
    }

    #[test]
    fn nearest_agrees_with_brute_force() {
        let mut rng = StdRng::seed_from_u64(5);
        let points = random_points::<3>(&mut rng, 300);
        let index = SpatialIndex::build(points.clone()).unwrap();
        for _ in 0..200 {
            let q = [
                rng.random_range(-120.0..120.0),
                rng.random_range(-120.0..120.0),
                rng.random_range(-120.0..120.0),
            ];
            let (_, d) = index.nearest_with_distance(&q);
            assert_abs_diff_eq!(d, brute_nearest(&points, &q), epsilon = 1e-12);
        }
    }

    #[test]
    fn radial_search_agrees_with_brute_force() {
        let mut rng = StdRng::seed_from_u64(21);
        let points = random_points::<2>(&mut rng, 400);
        let index = SpatialIndex::build(points.clone()).unwrap();
        for _ in 0..50 {
            let q = [rng.random_range(-100.0..100.0), rng.random_range(-100.0..100.0)];
            let r = rng.random_range(0.0..40.0);
            let found: HashSet<usize> = index.radial_search(&q, r, false).into_iter().copied().collect();
            let expected: HashSet<usize> = points
                .iter()
                .filter(|(_, c)| ((c[0] - q[0]).powi(2) + (c[1] - q[1]).powi(2)) <= r * r)
                .map(|(t, _)| *t)
                .collect();
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn radial_results_grow_with_radius() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = random_points::<2>(&mut rng, 250);
        let index = SpatialIndex::build(points).unwrap();
        let q = [5.0, -7.0];
        let mut previous: HashSet<usize> = HashSet::new();
        for step in 0..12 {
            let r = step as f64 * 8.0;
            let sorted: HashSet<usize> = index.radial_search(&q, r, true).into_iter().copied().collect();
            let unsorted: HashSet<usize> = index.radial_search(&q, r, false).into_iter().copied().collect();
            assert_eq!(sorted, unsorted);
            assert!(previous.is_subset(&sorted));
            previous = sorted;
        }
    }

    #[test]
    fn sorted_search_is_ascending() {
        let index = SpatialIndex::build(vec![
            ('a', [3.0, 0.0]),
            ('b', [1.0, 0.0]),
            ('c', [0.0, 2.0]),
            ('d', [9.0, 9.0]),
        ])
        .unwrap();
        let found = index.radial_search_with_distance(&[0.0, 0.0], 5.0, true);
        let tags: Vec<char> = found.iter().map(|(t, _)| **t).collect();
        assert_eq!(tags, vec!['b', 'c', 'a']);
        assert_eq!(found[2].1, 3.0);
        assert!(index.radial_search(&[0.0, 0.0], -1.0, false).is_empty());
    }

    #[test]
    fn duplicate_coordinates_are_all_found() {
        let index = SpatialIndex::build(vec![(1, [2.0, 2.0]), (2, [2.0, 2.0]), (3, [2.0, 2.0])]).unwrap();
        assert_eq!(index.radial_search(&[2.0, 2.0], 0.0, false).len(), 3);
        let tag = *index.nearest(&[2.0, 2.0]);
        assert!((1..=3).contains(&tag));
    }
}
