use nalgebra::Vector3;
use rayon::prelude::*;

use crate::{
    settings::ExecutionMode,
    shared::{AABB, Float, lit},
};

/// Padding applied on every side so that particles sitting exactly on the
/// maximum still fall inside the half-open box.
pub const BOUNDING_BOX_EPS: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox<F: Float> {
    pub min: Vector3<F>,
    pub max: Vector3<F>,
}

impl<F: Float> BoundingBox<F> {
    pub fn new(min: Vector3<F>, max: Vector3<F>) -> Self {
        Self { min, max }
    }

    /// Degenerate box used when there is nothing to bound.
    pub fn at_origin() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    pub fn from_point(p: &Vector3<F>) -> Self {
        Self::new(*p, *p)
    }

    /// Serial fold over `points`, `None` if empty.
    pub fn of_points(points: &[Vector3<F>]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        Some(
            rest.iter()
                .fold(Self::from_point(first), |acc, p| acc.merge(&Self::from_point(p))),
        )
    }

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.zip_map(&other.min, |a, b| a.min(b)),
            max: self.max.zip_map(&other.max, |a, b| a.max(b)),
        }
    }

    /// Box of all `positions`, reduced in two stages over `groups` groups.
    pub fn compute(positions: &[Vector3<F>], groups: usize, mode: ExecutionMode) -> Self {
        Self::reduce(&Self::partials(positions, groups, mode))
    }

    /// Stage one: one partial box per group of `ceil(N / groups)` positions.
    /// Trailing groups past the end of the input are empty.
    pub fn partials(
        positions: &[Vector3<F>],
        groups: usize,
        mode: ExecutionMode,
    ) -> Vec<Option<Self>> {
        let groups = groups.max(1);
        let per_group = positions.len().div_ceil(groups);
        let group = |g: usize| {
            let start = (g * per_group).min(positions.len());
            let end = (start + per_group).min(positions.len());
            Self::of_points(&positions[start..end])
        };
        match mode {
            ExecutionMode::Serial => (0..groups).map(group).collect(),
            ExecutionMode::Parallel => (0..groups).into_par_iter().map(group).collect(),
        }
    }

    /// Stage two: fold the partials into one box.
    pub fn reduce(partials: &[Option<Self>]) -> Self {
        partials
            .iter()
            .flatten()
            .copied()
            .reduce(|a, b| a.merge(&b))
            .unwrap_or_else(Self::at_origin)
    }

    pub fn adjust_to_fit_all(&mut self) {
        let eps = Vector3::repeat(lit::<F>(BOUNDING_BOX_EPS));
        self.min -= eps;
        self.max += eps;
    }

    pub fn center(&self) -> Vector3<F> {
        (self.min + self.max) * lit::<F>(0.5)
    }

    pub fn size(&self) -> Vector3<F> {
        self.max - self.min
    }
}

impl<F: Float> AABB<F> for BoundingBox<F> {
    fn min(&self) -> Vector3<F> {
        self.min
    }

    fn max(&self) -> Vector3<F> {
        self.max
    }
}
