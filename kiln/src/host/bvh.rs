use crate::maths::*;

pub const MAX_LEAF_SIZE: usize = 4;

/// Bytes one node would occupy in device memory.
pub const NODE_SIZE: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: Vec3::broadcast(f32::MAX),
            max: Vec3::broadcast(-f32::MAX),
        }
    }

    pub fn from_points(points: &[Vec3]) -> Self {
        let mut aabb = Self::empty();
        for &p in points.iter() {
            aabb.include_point(p);
        }
        aabb
    }

    pub fn include_point(&mut self, p: Vec3) {
        self.min = self.min.min_by_component(p);
        self.max = self.max.max_by_component(p);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min_by_component(other.min),
            max: self.max.max_by_component(other.max),
        }
    }

    pub fn centroid(&self) -> Vec3 {
        0.5 * (self.min + self.max)
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    pub fn transformed(&self, transform: &Transform3x4) -> Aabb {
        let corners = self.corners();
        let points: Vec<Vec3> = corners.iter().map(|&p| transform.transform_point(p)).collect();
        Aabb::from_points(&points)
    }

    /// Slab test, returns the entry distance when the ray overlaps `[t_min, t_max]`.
    pub fn intersect(&self, origin: Vec3, inv_dir: Vec3, t_min: f32, t_max: f32) -> Option<f32> {
        let t0 = (self.min - origin) * inv_dir;
        let t1 = (self.max - origin) * inv_dir;
        let near = t0.min_by_component(t1);
        let far = t0.max_by_component(t1);
        let enter = near.component_max().max(t_min);
        let exit = far.component_min().min(t_max);
        if enter <= exit {
            Some(enter)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf { bounds: Aabb, first: u32, count: u32 },
    Interior { bounds: Aabb, left: u32, right: u32 },
}

impl Node {
    fn bounds(&self) -> &Aabb {
        match self {
            Node::Leaf { bounds, .. } | Node::Interior { bounds, .. } => bounds,
        }
    }
}

/// Median split hierarchy over primitive bounds.
#[derive(Debug, Clone)]
pub struct Bvh {
    nodes: Vec<Node>,
    prim_indices: Vec<u32>,
}

impl Bvh {
    pub fn build(prim_bounds: &[Aabb]) -> Self {
        let mut bvh = Self {
            nodes: Vec::with_capacity(Self::max_node_count(prim_bounds.len())),
            prim_indices: (0..prim_bounds.len() as u32).collect(),
        };
        if !prim_bounds.is_empty() {
            bvh.build_node(prim_bounds, 0, prim_bounds.len());
        }
        bvh
    }

    /// Upper bound on node count, reserved when building.
    pub fn max_node_count(prim_count: usize) -> usize {
        (2 * prim_count).saturating_sub(1)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or_else(Aabb::empty, |node| *node.bounds())
    }

    fn build_node(&mut self, prim_bounds: &[Aabb], begin: usize, end: usize) -> u32 {
        let bounds = self.prim_indices[begin..end]
            .iter()
            .fold(Aabb::empty(), |acc, &i| acc.union(&prim_bounds[i as usize]));
        let node_index = self.nodes.len() as u32;
        let count = end - begin;
        if count <= MAX_LEAF_SIZE {
            self.nodes.push(Node::Leaf {
                bounds,
                first: begin as u32,
                count: count as u32,
            });
            return node_index;
        }

        let centroid_bounds = self.prim_indices[begin..end].iter().fold(Aabb::empty(), |mut acc, &i| {
            acc.include_point(prim_bounds[i as usize].centroid());
            acc
        });
        let extent = centroid_bounds.max - centroid_bounds.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        let key = |i: &u32| {
            let c = prim_bounds[*i as usize].centroid();
            [c.x, c.y, c.z][axis]
        };
        let mid = begin + count / 2;
        self.prim_indices[begin..end]
            .sort_by(|a, b| key(a).partial_cmp(&key(b)).unwrap_or(std::cmp::Ordering::Equal));

        // placeholder, patched once both children exist
        self.nodes.push(Node::Leaf {
            bounds,
            first: 0,
            count: 0,
        });
        let left = self.build_node(prim_bounds, begin, mid);
        let right = self.build_node(prim_bounds, mid, end);
        self.nodes[node_index as usize] = Node::Interior { bounds, left, right };
        node_index
    }

    /// Visits candidate primitives front to back, `visit` returns a new closest distance on a hit.
    pub fn traverse<F>(&self, origin: Vec3, dir: Vec3, t_min: f32, mut t_max: f32, mut visit: F)
    where
        F: FnMut(u32, f32) -> Option<f32>,
    {
        if self.nodes.is_empty() {
            return;
        }
        let inv_dir = Vec3::new(1.0 / dir.x, 1.0 / dir.y, 1.0 / dir.z);
        let mut stack = vec![0u32];
        while let Some(node_index) = stack.pop() {
            let node = &self.nodes[node_index as usize];
            if node.bounds().intersect(origin, inv_dir, t_min, t_max).is_none() {
                continue;
            }
            match *node {
                Node::Leaf { first, count, .. } => {
                    for &prim in self.prim_indices[first as usize..(first + count) as usize].iter() {
                        if let Some(t) = visit(prim, t_max) {
                            t_max = t_max.min(t);
                        }
                    }
                }
                Node::Interior { left, right, .. } => {
                    let left_t = self.nodes[left as usize].bounds().intersect(origin, inv_dir, t_min, t_max);
                    let right_t = self.nodes[right as usize].bounds().intersect(origin, inv_dir, t_min, t_max);
                    match (left_t, right_t) {
                        (Some(l), Some(r)) => {
                            if l <= r {
                                stack.push(right);
                                stack.push(left);
                            } else {
                                stack.push(left);
                                stack.push(right);
                            }
                        }
                        (Some(_), None) => stack.push(left),
                        (None, Some(_)) => stack.push(right),
                        (None, None) => {}
                    }
                }
            }
        }
    }
}

/// Distance and barycentrics of a ray triangle hit, Moller-Trumbore.
pub fn intersect_triangle(
    origin: Vec3,
    dir: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    t_min: f32,
    t_max: f32,
) -> Option<(f32, f32, f32)> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1.0e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t > t_min && t < t_max {
        Some((t, u, v))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_bounds(n: usize) -> Vec<Aabb> {
        (0..n)
            .map(|i| {
                let p = Vec3::new(i as f32, 0.0, 0.0);
                Aabb {
                    min: p,
                    max: p + Vec3::broadcast(0.5),
                }
            })
            .collect()
    }

    #[test]
    fn node_count_within_reservation() {
        for &n in [1usize, 4, 5, 17, 100].iter() {
            let bvh = Bvh::build(&grid_bounds(n));
            assert!(bvh.node_count() <= Bvh::max_node_count(n));
        }
        assert_eq!(Bvh::build(&[]).node_count(), 0);
    }

    #[test]
    fn traversal_finds_every_candidate() {
        let bounds = grid_bounds(20);
        let bvh = Bvh::build(&bounds);
        let mut visited = Vec::new();
        bvh.traverse(
            Vec3::new(-1.0, 0.25, 0.25),
            Vec3::unit_x(),
            0.0,
            f32::MAX,
            |prim, _| {
                visited.push(prim);
                None
            },
        );
        visited.sort_unstable();
        assert_eq!(visited, (0..20).collect::<Vec<u32>>());
    }

    #[test]
    fn triangle_hit() {
        let hit = intersect_triangle(
            Vec3::new(0.25, 0.25, 1.0),
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::zero(),
            Vec3::unit_x(),
            Vec3::unit_y(),
            0.0,
            f32::MAX,
        );
        let (t, u, v) = hit.unwrap();
        assert!((t - 1.0).abs() < 1.0e-6);
        assert!((u - 0.25).abs() < 1.0e-6);
        assert!((v - 0.25).abs() < 1.0e-6);
        assert!(intersect_triangle(
            Vec3::new(2.0, 2.0, 1.0),
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::zero(),
            Vec3::unit_x(),
            Vec3::unit_y(),
            0.0,
            f32::MAX
        )
        .is_none());
    }
}
