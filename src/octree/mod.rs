mod build;
pub mod grid;

pub use grid::{Grid, cell_count, level_offset, prefix_children, prefix_len};

use nalgebra::Vector3;
use rayon::prelude::*;

use crate::{
    bounding_box::BoundingBox,
    settings::ExecutionMode,
    shared::{Bounds, Float, lit},
};

pub type NodeId = u32;
pub type ParticleId = u32;

const NO_NODE: NodeId = NodeId::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Empty,
    Leaf(ParticleId),
    Parent([NodeId; 8]),
    /// Several particles at the maximum depth, treated as one point mass.
    Combined(u32),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Node<F: Float> {
    /// Half extent of the node's box.
    pub region_size: Vector3<F>,
    pub mass: F,
    /// `Σ position * mass` until [`Octree::normalize`] runs, the centroid after.
    pub center_of_mass: Vector3<F>,
    pub kind: NodeKind,
}

impl<F: Float> Node<F> {
    pub fn empty(region_size: Vector3<F>) -> Self {
        Self {
            region_size,
            mass: F::zero(),
            center_of_mass: Vector3::zeros(),
            kind: NodeKind::Empty,
        }
    }

    #[inline]
    pub fn children(&self) -> Option<&[NodeId; 8]> {
        match &self.kind {
            NodeKind::Parent(children) => Some(children),
            _ => None,
        }
    }

    /// Number of particles stored directly in this node.
    #[inline]
    pub fn particles_held(&self) -> usize {
        match self.kind {
            NodeKind::Leaf(_) => 1,
            NodeKind::Combined(count) => count as usize,
            NodeKind::Empty | NodeKind::Parent(_) => 0,
        }
    }
}

/// Octree over a flat node pool with a dense prefix of depth `prefix_depth`.
///
/// Index 0 is the root. Prefix nodes occupy `0..prefix_len(prefix_depth)`;
/// nodes past the prefix are handed out during [`Octree::build`] and
/// discarded by the next one.
#[derive(Clone, Debug)]
pub struct Octree<F: Float> {
    nodes: Vec<Node<F>>,
    capacity: usize,
    prefix_depth: u32,
    max_depth: u32,
    bounds: Bounds<F>,
    grid: Grid<F>,
    max_depth_reached: u32,
    /// Per particle: the `Combined` node holding it, or `NO_NODE`.
    combined_in: Vec<NodeId>,
}

impl<F: Float> Octree<F> {
    /// Allocates the pool and lays out the prefix topology.
    pub fn new(capacity: usize, prefix_depth: u32, max_depth: u32) -> Self {
        let prefix = prefix_len(prefix_depth);
        let mut nodes = Vec::with_capacity(capacity.max(prefix));
        nodes.resize(prefix, Node::empty(Vector3::zeros()));
        let mut tree = Self {
            nodes,
            capacity,
            prefix_depth,
            max_depth,
            bounds: Bounds::new(Vector3::zeros(), Vector3::zeros()),
            grid: Grid::new(&BoundingBox::at_origin(), prefix_depth),
            max_depth_reached: 0,
            combined_in: Vec::new(),
        };
        tree.reset_prefix();
        log::debug!(
            "octree pool: capacity {capacity}, prefix depth {prefix_depth} ({prefix} nodes)"
        );
        tree
    }

    /// Sets the geometry from an already padded bounding box and discards
    /// the previous build.
    pub fn prepare(&mut self, bbox: &BoundingBox<F>) {
        self.bounds = Bounds::new(bbox.center(), bbox.size() * lit::<F>(0.5));
        self.grid = Grid::new(bbox, self.prefix_depth);
        self.clear();
    }

    /// Drops every node past the prefix and empties the prefix, keeping the
    /// geometry.
    fn clear(&mut self) {
        self.nodes.truncate(self.prefix_len());
        self.max_depth_reached = 0;
        self.combined_in.clear();
        self.reset_prefix();
    }

    fn reset_prefix(&mut self) {
        let half = lit::<F>(0.5);
        let mut region = self.bounds.half_size;
        for level in 0..=self.prefix_depth {
            let start = level_offset(level);
            let end = level_offset(level + 1);
            for (index, node) in self.nodes[start..end].iter_mut().enumerate() {
                *node = Node::empty(region);
                if level < self.prefix_depth {
                    node.kind = NodeKind::Parent(prefix_children(level, index));
                }
            }
            region *= half;
        }
    }

    /// Bottom-up reduction over the internal prefix nodes. Everything below
    /// the frontier already carries its totals from insertion.
    pub fn accumulate_mass(&mut self, mode: ExecutionMode) {
        for level in (0..self.prefix_depth).rev() {
            let (parents, rest) = self.nodes.split_at_mut(level_offset(level + 1));
            let parents = &mut parents[level_offset(level)..];
            let children = &rest[..cell_count(level + 1)];
            let first_child = level_offset(level + 1);
            let sum = |node: &mut Node<F>| {
                if let NodeKind::Parent(ids) = node.kind {
                    let (mass, com) = ids.iter().fold(
                        (F::zero(), Vector3::<F>::zeros()),
                        |(m, c), &id| {
                            let child = &children[id as usize - first_child];
                            (m + child.mass, c + child.center_of_mass)
                        },
                    );
                    node.mass = mass;
                    node.center_of_mass = com;
                }
            };
            match mode {
                ExecutionMode::Serial => parents.iter_mut().for_each(sum),
                ExecutionMode::Parallel => parents.par_iter_mut().for_each(sum),
            }
        }
    }

    /// Turns every weighted position sum into a centroid.
    pub fn normalize(&mut self, items_per_chunk: usize, mode: ExecutionMode) {
        let divide = |chunk: &mut [Node<F>]| {
            for node in chunk.iter_mut().filter(|n| n.mass != F::zero()) {
                node.center_of_mass /= node.mass;
            }
        };
        let chunk = items_per_chunk.max(1);
        match mode {
            ExecutionMode::Serial => self.nodes.chunks_mut(chunk).for_each(divide),
            ExecutionMode::Parallel => self.nodes.par_chunks_mut(chunk).for_each(divide),
        }
    }

    #[inline]
    pub fn prefix_len(&self) -> usize {
        prefix_len(self.prefix_depth)
    }

    pub fn prefix_depth(&self) -> u32 {
        self.prefix_depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Nodes handed out by the last build, prefix included.
    pub fn used_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node<F> {
        &self.nodes[id as usize]
    }

    pub fn nodes(&self) -> &[Node<F>] {
        &self.nodes
    }

    pub fn root(&self) -> &Node<F> {
        &self.nodes[0]
    }

    pub fn bounds(&self) -> &Bounds<F> {
        &self.bounds
    }

    pub fn grid(&self) -> &Grid<F> {
        &self.grid
    }

    /// Pool index of depth-`D` cell `cell`.
    #[inline]
    pub fn cell_node(&self, cell: u32) -> NodeId {
        (level_offset(self.prefix_depth) + cell as usize) as NodeId
    }

    pub fn cell_bounds(&self, cell: u32) -> BoundingBox<F> {
        self.grid.cell_bounds(cell)
    }

    pub fn cell_of(&self, p: &Vector3<F>) -> u32 {
        self.grid.cell_of(p)
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Leaf(_)))
            .count()
    }

    /// Particles stored in the tree, combined nodes counted by their size.
    pub fn particle_count(&self) -> usize {
        self.nodes.iter().map(Node::particles_held).sum()
    }

    pub fn max_depth_reached(&self) -> u32 {
        self.max_depth_reached
    }

    /// The `Combined` node particle `id` was folded into, if any.
    #[inline]
    pub fn combined_node_of(&self, id: ParticleId) -> Option<NodeId> {
        match self.combined_in.get(id as usize) {
            Some(&node) if node != NO_NODE => Some(node),
            _ => None,
        }
    }

    /// Breadth-first walk yielding every node with its depth and box.
    pub fn iter(&self) -> NodeIter<'_, F> {
        NodeIter {
            tree: self,
            current: vec![(0, self.bounds)],
            next: Vec::new(),
            current_index: 0,
            depth: 0,
        }
    }
}

pub struct NodeIter<'a, F: Float> {
    tree: &'a Octree<F>,
    current: Vec<(NodeId, Bounds<F>)>,
    next: Vec<(NodeId, Bounds<F>)>,
    current_index: usize,
    depth: u32,
}

impl<'a, F: Float> Iterator for NodeIter<'a, F> {
    type Item = (u32, NodeId, Bounds<F>);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        if let Some(&(id, bounds)) = self.current.get(self.current_index) {
            if let Some(children) = tree.node(id).children() {
                self.next.extend(
                    children
                        .iter()
                        .enumerate()
                        .map(|(octant, &child)| (child, bounds.create_orthant(octant))),
                );
            }
            self.current_index += 1;
            Some((self.depth, id, bounds))
        } else if self.next.is_empty() {
            None
        } else {
            self.current = std::mem::take(&mut self.next);
            self.current_index = 0;
            self.depth += 1;
            self.next()
        }
    }
}
