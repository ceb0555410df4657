use std::mem::size_of;

use nalgebra::Vector3;

use crate::{
    error::SimError,
    octree::{self, Node},
    shared::{Float, ParticleData, lit},
};

/// Deepest dense prefix the grid supports (`8^7` cells).
pub const MAX_PREFIX_DEPTH: u32 = 7;
/// Deepest level a node may sit at.
pub const MAX_TREE_DEPTH: u32 = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    #[default]
    Parallel,
}

/// What has to be redone to move from one settings value to another.
///
/// Variants are ordered by cost; every tier implies the cheaper ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reconfigure {
    /// Only constants changed (theta, eps, G, work sizes...).
    Rebind,
    /// The dense prefix has to be laid out again.
    Reinitialize,
    /// Buffers have to be reallocated and particles regenerated.
    Reallocate,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationSettings<F: Float> {
    pub particle_count: usize,
    /// Hard size of the node pool, prefix included.
    pub node_capacity: usize,
    /// Depth `D` of the dense grid prefix.
    pub prefix_depth: u32,
    pub max_depth: u32,
    pub stack_size: usize,
    /// Barnes-Hut acceptance threshold.
    pub theta: F,
    pub eps: F,
    pub gravitational_constant: F,
    pub max_timestep: F,
    pub default_mass: F,
    pub bounding_box_groups: usize,
    pub barnes_hut_items_per_thread: usize,
    pub position_update_items_per_thread: usize,
    pub divide_by_mass_items_per_thread: usize,
    pub mode: ExecutionMode,
}

impl<F: Float> Default for SimulationSettings<F> {
    fn default() -> Self {
        Self {
            particle_count: 66048,
            node_capacity: 1 << 21,
            prefix_depth: 5,
            max_depth: 20,
            stack_size: 512,
            theta: lit(0.3),
            eps: lit(1e-3),
            gravitational_constant: lit(6.6743e-11),
            max_timestep: lit(0.1),
            default_mass: lit(5000.0),
            bounding_box_groups: 256,
            barnes_hut_items_per_thread: 4,
            position_update_items_per_thread: 16,
            divide_by_mass_items_per_thread: 2048,
            mode: ExecutionMode::Parallel,
        }
    }
}

macro_rules! with_setters {
    ($($name:ident: $field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(mut self, $field: $ty) -> Self {
                self.$field = $field;
                self
            }
        )*
    };
}

impl<F: Float> SimulationSettings<F> {
    with_setters! {
        with_particle_count: particle_count: usize,
        with_node_capacity: node_capacity: usize,
        with_prefix_depth: prefix_depth: u32,
        with_max_depth: max_depth: u32,
        with_stack_size: stack_size: usize,
        with_theta: theta: F,
        with_eps: eps: F,
        with_gravitational_constant: gravitational_constant: F,
        with_max_timestep: max_timestep: F,
        with_default_mass: default_mass: F,
        with_bounding_box_groups: bounding_box_groups: usize,
        with_barnes_hut_items_per_thread: barnes_hut_items_per_thread: usize,
        with_position_update_items_per_thread: position_update_items_per_thread: usize,
        with_divide_by_mass_items_per_thread: divide_by_mass_items_per_thread: usize,
        with_mode: mode: ExecutionMode,
    }

    /// Smallest traversal stack that can never overflow for `max_depth`.
    pub fn required_stack_size(&self) -> usize {
        7 * self.max_depth as usize + 8
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if !self.theta.is_finite() || self.theta < F::zero() {
            return Err(SimError::invalid(format!(
                "theta must be finite and non-negative, got {}",
                self.theta
            )));
        }
        if !self.eps.is_finite() || self.eps < F::zero() {
            return Err(SimError::invalid(format!(
                "eps must be finite and non-negative, got {}",
                self.eps
            )));
        }
        if !self.gravitational_constant.is_finite() {
            return Err(SimError::invalid("gravitational constant must be finite"));
        }
        if !(self.max_timestep > F::zero()) {
            return Err(SimError::invalid(format!(
                "max timestep must be positive, got {}",
                self.max_timestep
            )));
        }
        if !(self.default_mass > F::zero()) {
            return Err(SimError::invalid(format!(
                "default mass must be positive, got {}",
                self.default_mass
            )));
        }
        if self.particle_count == 0 {
            return Err(SimError::invalid("particle count must be at least 1"));
        }
        if self.particle_count > u32::MAX as usize {
            return Err(SimError::invalid(format!(
                "particle count {} does not fit a 32-bit particle id",
                self.particle_count
            )));
        }
        if self.prefix_depth > MAX_PREFIX_DEPTH {
            return Err(SimError::invalid(format!(
                "prefix depth {} exceeds {MAX_PREFIX_DEPTH}",
                self.prefix_depth
            )));
        }
        if self.max_depth <= self.prefix_depth || self.max_depth > MAX_TREE_DEPTH {
            return Err(SimError::invalid(format!(
                "max depth must be in {}..={MAX_TREE_DEPTH}, got {}",
                self.prefix_depth + 1,
                self.max_depth
            )));
        }
        let prefix = octree::prefix_len(self.prefix_depth);
        if self.node_capacity < prefix {
            return Err(SimError::invalid(format!(
                "node capacity {} is below the prefix size {prefix}",
                self.node_capacity
            )));
        }
        if self.node_capacity > u32::MAX as usize {
            return Err(SimError::invalid(format!(
                "node capacity {} does not fit a 32-bit node id",
                self.node_capacity
            )));
        }
        if self.stack_size < self.required_stack_size() {
            return Err(SimError::invalid(format!(
                "stack size {} is too small for max depth {} (needs {})",
                self.stack_size,
                self.max_depth,
                self.required_stack_size()
            )));
        }
        let work_sizes = [
            ("bounding box groups", self.bounding_box_groups),
            ("barnes-hut items per thread", self.barnes_hut_items_per_thread),
            ("position update items per thread", self.position_update_items_per_thread),
            ("divide by mass items per thread", self.divide_by_mass_items_per_thread),
        ];
        if let Some((name, _)) = work_sizes.iter().find(|(_, size)| *size == 0) {
            return Err(SimError::invalid(format!("{name} must be at least 1")));
        }
        Ok(())
    }

    /// Cheapest reconfiguration that brings a simulation set up with `prev`
    /// in line with `self`. `None` means nothing changed.
    pub fn changes_from(&self, prev: Option<&Self>) -> Option<Reconfigure> {
        let Some(prev) = prev else {
            return Some(Reconfigure::Reallocate);
        };
        if self == prev {
            return None;
        }
        if self.particle_count != prev.particle_count
            || self.node_capacity != prev.node_capacity
            || self.default_mass != prev.default_mass
        {
            return Some(Reconfigure::Reallocate);
        }
        if self.prefix_depth != prev.prefix_depth
            || self.max_depth != prev.max_depth
            || self.stack_size != prev.stack_size
        {
            return Some(Reconfigure::Reinitialize);
        }
        Some(Reconfigure::Rebind)
    }

    /// Approximate memory footprint of the buffers these settings allocate.
    pub fn estimated_bytes(&self) -> usize {
        let per_particle = size_of::<Vector3<F>>()
            + size_of::<ParticleData<F>>()
            + 2 * size_of::<[f32; 4]>();
        self.particle_count * per_particle
            + self.bounding_box_groups * size_of::<Vector3<F>>() * 2
            + self.node_capacity * size_of::<Node<F>>()
    }
}

/// Renders a byte count the way the settings panel shows it.
pub fn format_bytes(bytes: usize) -> String {
    const ABOVE: usize = 600;
    let b = bytes as f64;
    if bytes < ABOVE {
        format!("{bytes} B")
    } else if bytes < 1024 * ABOVE {
        format!("{:.2} KB", b / 1024.0)
    } else if bytes < 1024 * 1024 * ABOVE {
        format!("{:.2} MB", b / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", b / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SimulationSettings::<f32>::default().validate().unwrap();
        SimulationSettings::<f64>::default().validate().unwrap();
    }

    #[test]
    fn first_configuration_reallocates() {
        let s = SimulationSettings::<f32>::default();
        assert_eq!(s.changes_from(None), Some(Reconfigure::Reallocate));
        assert_eq!(s.changes_from(Some(&s)), None);
    }

    #[test]
    fn theta_change_only_rebinds() {
        let prev = SimulationSettings::<f32>::default();
        let next = prev.with_theta(0.7).with_eps(0.01).with_mode(ExecutionMode::Serial);
        assert_eq!(next.changes_from(Some(&prev)), Some(Reconfigure::Rebind));
    }

    #[test]
    fn depth_change_reinitializes() {
        let prev = SimulationSettings::<f32>::default();
        assert_eq!(
            prev.with_prefix_depth(3).changes_from(Some(&prev)),
            Some(Reconfigure::Reinitialize)
        );
        assert_eq!(
            prev.with_max_depth(24).changes_from(Some(&prev)),
            Some(Reconfigure::Reinitialize)
        );
    }

    #[test]
    fn count_change_reallocates_even_with_cheaper_changes() {
        let prev = SimulationSettings::<f32>::default();
        let next = prev.with_theta(0.1).with_prefix_depth(2).with_particle_count(10);
        assert_eq!(next.changes_from(Some(&prev)), Some(Reconfigure::Reallocate));
        assert!(Reconfigure::Rebind < Reconfigure::Reinitialize);
        assert!(Reconfigure::Reinitialize < Reconfigure::Reallocate);
    }

    #[test]
    fn rejects_bad_values() {
        let base = SimulationSettings::<f64>::default();
        let bad = [
            base.with_theta(f64::NAN),
            base.with_theta(-0.1),
            base.with_eps(-1.0),
            base.with_particle_count(0),
            base.with_prefix_depth(MAX_PREFIX_DEPTH + 1),
            base.with_max_depth(base.prefix_depth),
            base.with_node_capacity(octree::prefix_len(base.prefix_depth) - 1),
            base.with_stack_size(base.required_stack_size() - 1),
            base.with_barnes_hut_items_per_thread(0),
            base.with_max_timestep(0.0),
            base.with_default_mass(0.0),
        ];
        for settings in bad {
            assert!(
                matches!(settings.validate(), Err(SimError::InvalidSettings(_))),
                "{settings:?} should be rejected"
            );
        }
    }

    #[test]
    fn capacity_equal_to_prefix_is_accepted() {
        let s = SimulationSettings::<f32>::default()
            .with_prefix_depth(2)
            .with_node_capacity(octree::prefix_len(2));
        s.validate().unwrap();
    }

    #[test]
    fn estimate_grows_with_capacity() {
        let s = SimulationSettings::<f32>::default();
        let bigger = s.with_node_capacity(s.node_capacity * 2);
        assert!(bigger.estimated_bytes() > s.estimated_bytes());
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }
}
