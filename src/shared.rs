// This file defines the scalar, vector and particle types shared by every stage of the pipeline.

use nalgebra::{RealField, Vector3};
use num_traits::NumCast;

use crate::{error::SimError, settings::ExecutionMode};

/// Scalar type the whole engine is generic over (`f32` and `f64` in practice).
pub trait Float: RealField + NumCast + Copy + Send + Sync + 'static {}

impl<T> Float for T where T: RealField + NumCast + Copy + Send + Sync + 'static {}

/// Converts an `f64` literal into the simulation scalar.
#[inline]
pub fn lit<F: Float>(x: f64) -> F {
    nalgebra::convert(x)
}

/// Largest of the three components.
#[inline]
pub fn max_component<F: Float>(v: &Vector3<F>) -> F {
    v.x.max(v.y).max(v.z)
}

/// Everything a particle carries besides its position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleData<F: Float> {
    pub velocity: Vector3<F>,
    /// Written by the force evaluator every step, never accumulated across steps.
    pub force: Vector3<F>,
    pub mass: F,
}

impl<F: Float> ParticleData<F> {
    pub fn new(velocity: Vector3<F>, mass: F) -> Self {
        Self {
            velocity,
            force: Vector3::zeros(),
            mass,
        }
    }

    pub fn at_rest(mass: F) -> Self {
        Self::new(Vector3::zeros(), mass)
    }
}

pub trait AABB<F: Float> {
    fn min(&self) -> Vector3<F>;
    fn max(&self) -> Vector3<F>;

    /// Half-open containment: inclusive lower corner, exclusive upper corner.
    fn contains(&self, p: &Vector3<F>) -> bool {
        let (min, max) = (self.min(), self.max());
        (0..3).all(|axis| p[axis] >= min[axis] && p[axis] < max[axis])
    }
}

/// An axis-aligned box stored as center and half extent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds<F: Float> {
    pub center: Vector3<F>,
    pub half_size: Vector3<F>,
}

impl<F: Float> Bounds<F> {
    pub fn new(center: Vector3<F>, half_size: Vector3<F>) -> Self {
        Self { center, half_size }
    }

    /// Bounds of child octant `i`.
    pub fn create_orthant(&self, i: usize) -> Self {
        let half = self.half_size * lit::<F>(0.5);
        Self {
            center: self.center + octant_offset::<F>(i).component_mul(&half),
            half_size: half,
        }
    }
}

impl<F: Float> AABB<F> for Bounds<F> {
    fn min(&self) -> Vector3<F> {
        self.center - self.half_size
    }

    fn max(&self) -> Vector3<F> {
        self.center + self.half_size
    }
}

/// Octant of `p` around `center`: bit0 is `x > center.x`, bit1 is y, bit2 is z.
#[inline]
pub fn octant_of<F: Float>(center: &Vector3<F>, p: &Vector3<F>) -> usize {
    (p.x > center.x) as usize | ((p.y > center.y) as usize) << 1 | ((p.z > center.z) as usize) << 2
}

/// Per-axis sign (`-1` or `+1`) of octant `i`.
#[inline]
pub fn octant_offset<F: Float>(i: usize) -> Vector3<F> {
    let sign = |bit: usize| if i & bit != 0 { F::one() } else { -F::one() };
    Vector3::new(sign(1), sign(2), sign(4))
}

pub trait Simulation<F: Float> {
    fn init(&mut self) -> Result<(), SimError>;
    /// Rebuilds the tree from the current positions and overwrites every particle's force.
    fn update_forces(&mut self) -> Result<(), SimError>;
    fn step_by(&mut self, dt: F) -> Result<(), SimError>;
    fn elapsed(&self) -> F;
    fn positions(&self) -> &[Vector3<F>];
    fn particle_data(&self) -> &[ParticleData<F>];
}

pub trait Integrator<F: Float> {
    fn init(&mut self);
    fn integrate(
        &mut self,
        positions: &mut [Vector3<F>],
        data: &mut [ParticleData<F>],
        dt: F,
        items_per_chunk: usize,
        mode: ExecutionMode,
    );
}
