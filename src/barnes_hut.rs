use nalgebra::Vector3;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::{
    octree::{NodeId, NodeKind, Octree, ParticleId},
    settings::{ExecutionMode, SimulationSettings},
    shared::{Float, ParticleData, lit, max_component},
};

/// Constants the traversal needs, copied out of the settings so a rebind
/// is a plain assignment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForceParams<F: Float> {
    pub theta: F,
    pub eps: F,
    pub gravitational_constant: F,
    pub stack_size: usize,
}

impl<F: Float> From<&SimulationSettings<F>> for ForceParams<F> {
    fn from(settings: &SimulationSettings<F>) -> Self {
        Self {
            theta: settings.theta,
            eps: settings.eps,
            gravitational_constant: settings.gravitational_constant,
            stack_size: settings.stack_size,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BarnesHut<F: Float> {
    pub params: ForceParams<F>,
}

impl<F: Float> BarnesHut<F> {
    pub fn new(params: ForceParams<F>) -> Self {
        Self { params }
    }

    /// Approximate gravitational force on particle `id` at `pos`.
    ///
    /// A node is used as a point mass when it holds particles directly or
    /// when `2 * max(region_size) / distance < theta`; otherwise its
    /// children are visited.
    pub fn force_on(
        &self,
        tree: &Octree<F>,
        id: ParticleId,
        pos: &Vector3<F>,
        mass: F,
    ) -> Vector3<F> {
        let ForceParams {
            theta,
            eps,
            gravitational_constant: g,
            stack_size,
        } = self.params;
        let eps2 = eps * eps;
        let two = lit::<F>(2.0);

        let mut force = Vector3::zeros();
        let mut stack: SmallVec<[NodeId; 64]> = SmallVec::new();
        stack.push(0);

        while let Some(at) = stack.pop() {
            let node = tree.node(at);
            if node.mass == F::zero() || node.kind == NodeKind::Leaf(id) {
                continue;
            }

            // A combined node holding this particle acts with the others only.
            let (node_mass, center_of_mass) = match node.kind {
                NodeKind::Combined(_) if tree.combined_node_of(id) == Some(at) => {
                    let rest = node.mass - mass;
                    if rest <= F::zero() {
                        continue;
                    }
                    (rest, (node.center_of_mass * node.mass - pos * mass) / rest)
                }
                _ => (node.mass, node.center_of_mass),
            };

            let delta = center_of_mass - pos;
            let dist2 = delta.norm_squared() + eps2;
            let distance = dist2.sqrt();
            if distance == F::zero() {
                continue;
            }

            match node.kind {
                NodeKind::Parent(children)
                    if !(two * max_component(&node.region_size) / distance < theta) =>
                {
                    debug_assert!(stack.len() + 8 <= stack_size, "traversal stack overflow");
                    stack.extend(children.iter().rev().copied());
                }
                _ => {
                    let magnitude = g * mass * node_mass / dist2;
                    force += delta * (magnitude / distance);
                }
            }
        }
        force
    }

    /// Overwrites the force of every particle, `items_per_chunk` particles
    /// per work item.
    pub fn compute_forces(
        &self,
        tree: &Octree<F>,
        positions: &[Vector3<F>],
        data: &mut [ParticleData<F>],
        items_per_chunk: usize,
        mode: ExecutionMode,
    ) {
        let chunk = items_per_chunk.max(1);
        let evaluate = |(c, particles): (usize, &mut [ParticleData<F>])| {
            for (j, particle) in particles.iter_mut().enumerate() {
                let id = c * chunk + j;
                particle.force =
                    self.force_on(tree, id as ParticleId, &positions[id], particle.mass);
            }
        };
        match mode {
            ExecutionMode::Serial => data.chunks_mut(chunk).enumerate().for_each(evaluate),
            ExecutionMode::Parallel => data.par_chunks_mut(chunk).enumerate().for_each(evaluate),
        }
    }
}
