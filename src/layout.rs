//! Initial particle clouds.

use std::f64::consts::PI;

use nalgebra::{Rotation3, Vector3};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::{
    error::SimError,
    shared::{Float, ParticleData, lit},
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleSet<F: Float> {
    pub positions: Vec<Vector3<F>>,
    pub data: Vec<ParticleData<F>>,
}

impl<F: Float> ParticleSet<F> {
    pub fn with_capacity(count: usize) -> Self {
        Self {
            positions: Vec::with_capacity(count),
            data: Vec::with_capacity(count),
        }
    }

    pub fn push(&mut self, position: Vector3<F>, data: ParticleData<F>) {
        self.positions.push(position);
        self.data.push(data);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn total_mass(&self) -> F {
        self.data.iter().fold(F::zero(), |acc, d| acc + d.mass)
    }
}

pub trait Layout<F: Float>: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, count: usize, default_mass: F) -> Result<ParticleSet<F>, SimError>;
}

fn standard_normal() -> Result<Normal<f64>, SimError> {
    Normal::new(0.0, 1.0).map_err(|e| SimError::collaborator(e, "building the normal distribution"))
}

fn vec3<F: Float>(v: Vector3<f64>) -> Vector3<F> {
    v.map(lit::<F>)
}

/// Normally distributed cloud around the origin, every particle at rest
/// with the default mass.
#[derive(Clone, Debug, Default)]
pub struct Uniform {
    pub seed: u64,
}

impl<F: Float> Layout<F> for Uniform {
    fn name(&self) -> &str {
        "uniform"
    }

    fn generate(&self, count: usize, default_mass: F) -> Result<ParticleSet<F>, SimError> {
        let normal = standard_normal()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut set = ParticleSet::with_capacity(count);
        for _ in 0..count {
            let p = Vector3::from_fn(|_, _| normal.sample(&mut rng));
            set.push(vec3(p), ParticleData::at_rest(default_mass));
        }
        Ok(set)
    }
}

/// Thin rotating disc around `center`, drifting with `velocity`.
#[derive(Clone, Debug)]
pub struct Galaxy {
    pub center: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub seed: u64,
}

impl Default for Galaxy {
    fn default() -> Self {
        Self {
            center: Vector3::zeros(),
            velocity: Vector3::zeros(),
            seed: 0,
        }
    }
}

struct Disc {
    center: Vector3<f64>,
    velocity: Vector3<f64>,
    tilt: Rotation3<f64>,
}

impl Disc {
    fn new<R: Rng>(
        rng: &mut R,
        normal: &Normal<f64>,
        center: Vector3<f64>,
        velocity: Vector3<f64>,
    ) -> Self {
        let angle = normal.sample(rng) * PI;
        Self {
            center,
            velocity,
            tilt: Rotation3::from_axis_angle(&Vector3::x_axis(), angle),
        }
    }

    fn sample<F: Float, R: Rng>(
        &self,
        rng: &mut R,
        normal: &Normal<f64>,
        default_mass: f64,
        set: &mut ParticleSet<F>,
    ) {
        let phi = normal.sample(rng) * 2.0 * PI;
        let radius = normal.sample(rng);
        let height = normal.sample(rng) / 20.0;
        let mass = ((normal.sample(rng) + 1.0) / 2.0 * default_mass * 0.25).abs();

        let local = Vector3::new(phi.cos() * radius, height, phi.sin() * radius);
        let position = self.tilt * local + self.center;

        let offset = position - self.center;
        let tangent = Vector3::y()
            .cross(&offset)
            .try_normalize(f64::EPSILON)
            .unwrap_or_else(Vector3::zeros);
        let velocity = tangent * offset.norm() * 25.0 / 100.0 + self.velocity;

        set.push(vec3(position), ParticleData::new(vec3(velocity), lit(mass)));
    }
}

fn mass_as_f64<F: Float>(mass: F) -> f64 {
    num_traits::cast::<F, f64>(mass).unwrap_or(0.0)
}

impl<F: Float> Layout<F> for Galaxy {
    fn name(&self) -> &str {
        "galaxy"
    }

    fn generate(&self, count: usize, default_mass: F) -> Result<ParticleSet<F>, SimError> {
        let normal = standard_normal()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let disc = Disc::new(&mut rng, &normal, self.center, self.velocity);
        let mut set = ParticleSet::with_capacity(count);
        for _ in 0..count {
            disc.sample(&mut rng, &normal, mass_as_f64(default_mass), &mut set);
        }
        Ok(set)
    }
}

/// Two discs on a collision course: one at `(3, 3, 3)` moving towards one
/// at rest at `(-3, -3, -3)`.
#[derive(Clone, Debug, Default)]
pub struct GalaxiesClashing {
    pub seed: u64,
}

impl<F: Float> Layout<F> for GalaxiesClashing {
    fn name(&self) -> &str {
        "galaxies-clashing"
    }

    fn generate(&self, count: usize, default_mass: F) -> Result<ParticleSet<F>, SimError> {
        let normal = standard_normal()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let g1_center = Vector3::repeat(3.0);
        let g2_center = -g1_center;
        let g1_velocity = (g2_center - g1_center) * 0.01;
        let mass = mass_as_f64(default_mass);

        let mut set = ParticleSet::with_capacity(count);
        let first = Disc::new(&mut rng, &normal, g1_center, g1_velocity);
        for _ in 0..count / 2 {
            first.sample(&mut rng, &normal, mass, &mut set);
        }
        let second = Disc::new(&mut rng, &normal, g2_center, Vector3::zeros());
        for _ in 0..count - count / 2 {
            second.sample(&mut rng, &normal, mass, &mut set);
        }
        Ok(set)
    }
}

/// Hands out a prepared particle set unchanged, whatever count is asked for.
#[derive(Clone, Debug)]
pub struct Fixed<F: Float>(pub ParticleSet<F>);

impl<F: Float> Layout<F> for Fixed<F> {
    fn name(&self) -> &str {
        "fixed"
    }

    fn generate(&self, _count: usize, _default_mass: F) -> Result<ParticleSet<F>, SimError> {
        Ok(self.0.clone())
    }
}
