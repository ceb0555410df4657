use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::Vector3;
use rayon::prelude::*;

use super::{NO_NODE, Node, NodeId, NodeKind, Octree, ParticleId, cell_count};
use crate::{
    bounding_box::BoundingBox,
    error::SimError,
    settings::ExecutionMode,
    shared::{Float, ParticleData, lit, octant_of, octant_offset},
};

/// Subtree grown under one depth-`D` cell. Local index 0 is the cell itself,
/// every split appends 8 siblings.
struct CellTree<F: Float> {
    cell: u32,
    nodes: Vec<Node<F>>,
    depth_reached: u32,
    /// `(particle, local node)` for every particle folded into a `Combined` node.
    combined: Vec<(ParticleId, u32)>,
}

/// Particle ids grouped by owning cell, ascending within each cell.
struct Buckets {
    starts: Vec<usize>,
    order: Vec<ParticleId>,
}

impl Buckets {
    fn cell(&self, cell: usize) -> &[ParticleId] {
        &self.order[self.starts[cell]..self.starts[cell + 1]]
    }
}

fn claim(budget: &AtomicUsize, capacity: usize) -> Result<(), SimError> {
    let used = budget.fetch_add(8, Ordering::Relaxed) + 8;
    if used > capacity {
        return Err(SimError::TreeCapacityExceeded { used, capacity });
    }
    Ok(())
}

impl<F: Float> Octree<F> {
    /// Rebuilds the tree for `positions` inside `bbox`. Mass totals below
    /// the prefix frontier are complete afterwards, the prefix still needs
    /// [`Octree::accumulate_mass`].
    pub fn build(
        &mut self,
        bbox: &BoundingBox<F>,
        positions: &[Vector3<F>],
        data: &[ParticleData<F>],
        mode: ExecutionMode,
    ) -> Result<(), SimError> {
        self.prepare(bbox);
        self.insert(positions, data, mode)
    }

    /// Inserts every particle into the tree, discarding whatever the last
    /// build left behind but keeping the geometry of the last
    /// [`Octree::prepare`].
    ///
    /// Each cell grows its subtree in a private arena; the arenas are then
    /// spliced into the pool in cell order, so the resulting layout does not
    /// depend on `mode`.
    pub fn insert(
        &mut self,
        positions: &[Vector3<F>],
        data: &[ParticleData<F>],
        mode: ExecutionMode,
    ) -> Result<(), SimError> {
        if positions.len() != data.len() {
            return Err(SimError::ParticleCountMismatch {
                expected: positions.len(),
                actual: data.len(),
            });
        }
        self.clear();
        self.combined_in.resize(positions.len(), NO_NODE);
        let buckets = self.bin(positions, mode);
        let occupied: Vec<u32> = (0..cell_count(self.prefix_depth))
            .filter(|&cell| !buckets.cell(cell).is_empty())
            .map(|cell| cell as u32)
            .collect();

        let budget = AtomicUsize::new(self.prefix_len());
        let grow = |&cell: &u32| {
            self.grow_cell(cell, buckets.cell(cell as usize), positions, data, &budget)
        };
        let trees = match mode {
            ExecutionMode::Serial => occupied.iter().map(grow).collect::<Result<Vec<_>, _>>()?,
            ExecutionMode::Parallel => {
                occupied.par_iter().map(grow).collect::<Result<Vec<_>, _>>()?
            }
        };

        for tree in trees {
            self.splice(tree);
        }
        debug_assert_eq!(self.nodes.len(), budget.into_inner());
        log::trace!(
            "octree built: {} of {} nodes, depth {}",
            self.nodes.len(),
            self.capacity,
            self.max_depth_reached
        );
        Ok(())
    }

    fn bin(&self, positions: &[Vector3<F>], mode: ExecutionMode) -> Buckets {
        let grid = &self.grid;
        let cells: Vec<u32> = match mode {
            ExecutionMode::Serial => positions.iter().map(|p| grid.cell_of(p)).collect(),
            ExecutionMode::Parallel => positions.par_iter().map(|p| grid.cell_of(p)).collect(),
        };

        let mut starts = vec![0usize; cell_count(self.prefix_depth) + 1];
        for &cell in &cells {
            starts[cell as usize + 1] += 1;
        }
        for i in 1..starts.len() {
            starts[i] += starts[i - 1];
        }
        let mut cursor = starts.clone();
        let mut order = vec![0; cells.len()];
        for (id, &cell) in cells.iter().enumerate() {
            order[cursor[cell as usize]] = id as ParticleId;
            cursor[cell as usize] += 1;
        }
        Buckets { starts, order }
    }

    fn grow_cell(
        &self,
        cell: u32,
        ids: &[ParticleId],
        positions: &[Vector3<F>],
        data: &[ParticleData<F>],
        budget: &AtomicUsize,
    ) -> Result<CellTree<F>, SimError> {
        let mut tree = CellTree {
            cell,
            nodes: vec![*self.node(self.cell_node(cell))],
            depth_reached: self.prefix_depth,
            combined: Vec::new(),
        };
        let center = self.grid.cell_center(cell);
        for &id in ids {
            self.descend(&mut tree, center, id, positions, data, budget)?;
        }
        Ok(tree)
    }

    fn descend(
        &self,
        tree: &mut CellTree<F>,
        cell_center: Vector3<F>,
        id: ParticleId,
        positions: &[Vector3<F>],
        data: &[ParticleData<F>],
        budget: &AtomicUsize,
    ) -> Result<(), SimError> {
        let half_factor = lit::<F>(0.5);
        let p = positions[id as usize];
        let m = data[id as usize].mass;

        let mut at = 0;
        let mut center = cell_center;
        let mut half = tree.nodes[0].region_size;
        let mut level = self.prefix_depth;
        loop {
            let node = &mut tree.nodes[at];
            match node.kind {
                NodeKind::Empty => {
                    node.mass = m;
                    node.center_of_mass = p * m;
                    node.kind = NodeKind::Leaf(id);
                    break;
                }
                NodeKind::Combined(count) => {
                    node.mass += m;
                    node.center_of_mass += p * m;
                    node.kind = NodeKind::Combined(count + 1);
                    tree.combined.push((id, at as u32));
                    break;
                }
                NodeKind::Leaf(resident) if level >= self.max_depth => {
                    node.mass += m;
                    node.center_of_mass += p * m;
                    node.kind = NodeKind::Combined(2);
                    tree.combined.extend([(resident, at as u32), (id, at as u32)]);
                    break;
                }
                NodeKind::Leaf(resident) => {
                    claim(budget, self.capacity)?;
                    let child_half = half * half_factor;
                    let moved = Node {
                        region_size: child_half,
                        kind: NodeKind::Leaf(resident),
                        ..*node
                    };
                    let resident_octant = octant_of(&center, &positions[resident as usize]);
                    let first = tree.nodes.len();
                    tree.nodes[at].kind =
                        NodeKind::Parent(std::array::from_fn(|k| (first + k) as NodeId));
                    tree.nodes.extend((0..8).map(|k| {
                        if k == resident_octant { moved } else { Node::empty(child_half) }
                    }));
                    // Revisit the same node, now a parent, to add the incoming particle.
                }
                NodeKind::Parent(children) => {
                    node.mass += m;
                    node.center_of_mass += p * m;
                    let octant = octant_of(&center, &p);
                    half *= half_factor;
                    center += octant_offset::<F>(octant).component_mul(&half);
                    at = children[octant] as usize;
                    level += 1;
                }
            }
        }
        tree.depth_reached = tree.depth_reached.max(level);
        Ok(())
    }

    /// Copies a cell arena into the pool: local 0 becomes the cell node,
    /// local `i >= 1` lands at `len + i - 1`.
    fn splice(&mut self, tree: CellTree<F>) {
        let base = self.nodes.len();
        let cell_node = self.cell_node(tree.cell) as usize;
        let global = |local: usize| if local == 0 { cell_node } else { base + local - 1 };
        let remap = |kind: NodeKind| match kind {
            NodeKind::Parent(children) => {
                NodeKind::Parent(children.map(|c| global(c as usize) as NodeId))
            }
            other => other,
        };
        for &(particle, local) in &tree.combined {
            self.combined_in[particle as usize] = global(local as usize) as NodeId;
        }
        let mut nodes = tree.nodes.into_iter().map(|mut node| {
            node.kind = remap(node.kind);
            node
        });
        if let Some(root) = nodes.next() {
            self.nodes[cell_node] = root;
        }
        self.nodes.extend(nodes);
        self.max_depth_reached = self.max_depth_reached.max(tree.depth_reached);
    }
}
