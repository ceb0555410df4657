use nalgebra::Vector3;
use rayon::prelude::*;

use crate::{
    settings::{ExecutionMode, SimulationSettings},
    shared::{Float, ParticleData},
};

/// All-pairs force evaluation with the same softening as the tree walk.
#[derive(Clone, Copy, Debug)]
pub struct DirectSum<F: Float> {
    g: F,
    eps: F,
}

impl<F: Float> DirectSum<F> {
    pub fn new(g: F, eps: F) -> Self {
        Self { g, eps }
    }

    pub fn from_settings(settings: &SimulationSettings<F>) -> Self {
        Self::new(settings.gravitational_constant, settings.eps)
    }

    /// Force exerted on a body of mass `m_i` at `p_i` by one at `p_j`.
    #[inline]
    fn pair(&self, p_i: &Vector3<F>, m_i: F, p_j: &Vector3<F>, m_j: F) -> Vector3<F> {
        let delta = p_j - p_i;
        let dist2 = delta.norm_squared() + self.eps * self.eps;
        let distance = dist2.sqrt();
        if distance == F::zero() {
            return Vector3::zeros();
        }
        delta * (self.g * m_i * m_j / dist2 / distance)
    }

    /// Exact force on particle `i` from every other particle.
    pub fn force_on(
        &self,
        positions: &[Vector3<F>],
        data: &[ParticleData<F>],
        i: usize,
    ) -> Vector3<F> {
        positions
            .iter()
            .zip(data)
            .enumerate()
            .filter(|&(j, _)| j != i)
            .fold(Vector3::zeros(), |acc, (_, (p_j, d_j))| {
                acc + self.pair(&positions[i], data[i].mass, p_j, d_j.mass)
            })
    }

    pub fn compute_forces(
        &self,
        positions: &[Vector3<F>],
        data: &mut [ParticleData<F>],
        mode: ExecutionMode,
    ) {
        match mode {
            ExecutionMode::Serial => {
                for d in data.iter_mut() {
                    d.force = Vector3::zeros();
                }
                for i in 0..positions.len() {
                    for j in 0..i {
                        let f = self.pair(&positions[i], data[i].mass, &positions[j], data[j].mass);
                        data[i].force += f;
                        data[j].force -= f;
                    }
                }
            }
            ExecutionMode::Parallel => {
                let masses: Vec<F> = data.iter().map(|d| d.mass).collect();
                data.par_iter_mut().enumerate().for_each(|(i, d)| {
                    let m_i = d.mass;
                    d.force = positions
                        .iter()
                        .zip(&masses)
                        .enumerate()
                        .filter(|&(j, _)| j != i)
                        .fold(Vector3::zeros(), |acc, (_, (p_j, &m_j))| {
                            acc + self.pair(&positions[i], m_i, p_j, m_j)
                        });
                });
            }
        }
    }
}
