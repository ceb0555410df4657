use nalgebra::Vector3;
use rayon::prelude::*;
use web_time::Instant;

use crate::{
    settings::ExecutionMode,
    shared::{Float, Integrator, ParticleData, lit},
};

/// Semi-implicit Euler: `v += f / m * dt`, then `x += v * dt` with the new
/// velocity. Massless particles keep their velocity.
#[derive(Clone, Debug, Default)]
pub struct SemiImplicitEuler;

impl SemiImplicitEuler {
    pub fn new() -> Self {
        Self
    }

    #[inline]
    fn advance<F: Float>(position: &mut Vector3<F>, data: &mut ParticleData<F>, dt: F) {
        if data.mass != F::zero() {
            data.velocity += data.force * (dt / data.mass);
        }
        *position += data.velocity * dt;
    }

    /// Single step over matching position / data slices.
    pub fn step<F: Float>(
        positions: &mut [Vector3<F>],
        data: &mut [ParticleData<F>],
        dt: F,
        items_per_chunk: usize,
        mode: ExecutionMode,
    ) {
        let chunk = items_per_chunk.max(1);
        let update = |(xs, ds): (&mut [Vector3<F>], &mut [ParticleData<F>])| {
            for (x, d) in xs.iter_mut().zip(ds.iter_mut()) {
                Self::advance(x, d, dt);
            }
        };
        match mode {
            ExecutionMode::Serial => positions
                .chunks_mut(chunk)
                .zip(data.chunks_mut(chunk))
                .for_each(update),
            ExecutionMode::Parallel => positions
                .par_chunks_mut(chunk)
                .zip(data.par_chunks_mut(chunk))
                .for_each(update),
        }
    }
}

impl<F: Float> Integrator<F> for SemiImplicitEuler {
    fn init(&mut self) {}

    fn integrate(
        &mut self,
        positions: &mut [Vector3<F>],
        data: &mut [ParticleData<F>],
        dt: F,
        items_per_chunk: usize,
        mode: ExecutionMode,
    ) {
        Self::step(positions, data, dt, items_per_chunk, mode);
    }
}

/// Wall-clock time between steps, clamped so a stall does not turn into one
/// huge step.
#[derive(Clone, Debug)]
pub struct StepTimer {
    prev: Instant,
}

impl Default for StepTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTimer {
    pub fn new() -> Self {
        Self {
            prev: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.prev = Instant::now();
    }

    /// Seconds since the previous tick, at most `max_timestep`.
    pub fn tick<F: Float>(&mut self, max_timestep: F) -> F {
        let now = Instant::now();
        let elapsed = lit::<F>(now.duration_since(self.prev).as_secs_f64());
        self.prev = now;
        elapsed.min(max_timestep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn velocity_updates_before_position() {
        let mut positions = [Vector3::new(1.0, 0.0, 0.0)];
        let mut data = [ParticleData {
            velocity: Vector3::new(0.0, 1.0, 0.0),
            force: Vector3::new(4.0, 0.0, 0.0),
            mass: 2.0,
        }];
        let mut euler = SemiImplicitEuler::new();
        euler.integrate(&mut positions, &mut data, 0.5, 16, ExecutionMode::Serial);
        assert_relative_eq!(data[0].velocity, Vector3::new(1.0, 1.0, 0.0));
        assert_relative_eq!(positions[0], Vector3::new(1.5, 0.5, 0.0));
    }

    #[test]
    fn modes_agree_bitwise() {
        let mut serial_x: Vec<_> = (0..101).map(|i| Vector3::repeat(i as f32)).collect();
        let mut serial_d: Vec<_> = (0..101)
            .map(|i| ParticleData {
                velocity: Vector3::new(0.1, -0.2, i as f32),
                force: Vector3::new(i as f32, 1.0, -1.0),
                mass: 1.0 + i as f32,
            })
            .collect();
        let (mut par_x, mut par_d) = (serial_x.clone(), serial_d.clone());
        SemiImplicitEuler::step(&mut serial_x, &mut serial_d, 0.01, 16, ExecutionMode::Serial);
        SemiImplicitEuler::step(&mut par_x, &mut par_d, 0.01, 16, ExecutionMode::Parallel);
        assert_eq!(serial_x, par_x);
        assert_eq!(serial_d, par_d);
    }

    #[test]
    fn timer_is_clamped() {
        let mut timer = StepTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(timer.tick(0.001f64), 0.001);
        assert!(timer.tick(10.0f64) < 10.0);
    }
}
