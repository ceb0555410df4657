use approx::assert_relative_eq;
use bhlib::{
    Command, ExecutionMode, NBody, Reconfigure, SimulationSettings,
    brute_force::DirectSum,
    integrator::SemiImplicitEuler,
    layout::{Fixed, GalaxiesClashing, ParticleSet},
    octree::prefix_len,
    shared::{ParticleData, Simulation},
    snapshot::SnapshotReader,
};
use nalgebra::Vector3;

fn two_bodies() -> NBody<f64> {
    let mut set = ParticleSet::default();
    set.push(Vector3::zeros(), ParticleData::at_rest(1e11));
    set.push(Vector3::new(10.0, 0.0, 0.0), ParticleData::at_rest(1.0));
    let mut sim = NBody::new(Box::new(Fixed(set)), SemiImplicitEuler::new());
    sim.handle(Command::Apply(
        SimulationSettings::default()
            .with_particle_count(2)
            .with_prefix_depth(2)
            .with_node_capacity(prefix_len(2) + 64)
            .with_eps(0.0)
            .with_theta(0.0)
            .with_gravitational_constant(6.6743e-11),
    ))
    .unwrap();
    sim
}

#[test]
fn light_body_falls_towards_heavy_body() {
    let mut sim = two_bodies();
    sim.update_forces().unwrap();
    let force = sim.particle_data()[1].force;
    assert_relative_eq!(force.x, -0.066743, max_relative = 1e-9);
    assert_eq!((force.y, force.z), (0.0, 0.0));
    assert_relative_eq!(sim.particle_data()[0].force, -force, max_relative = 1e-9);

    sim.step_by(1.0).unwrap();
    assert!(sim.positions()[1].x < 10.0);
    assert_relative_eq!(sim.particle_data()[1].velocity.x, -0.066743, max_relative = 1e-9);
    assert_eq!(sim.elapsed(), 1.0);
}

#[test]
fn force_is_overwritten_each_step() {
    let mut sim = two_bodies();
    sim.update_forces().unwrap();
    let first = sim.particle_data()[1].force;
    sim.update_forces().unwrap();
    assert_eq!(sim.particle_data()[1].force, first);
}

#[test]
fn galaxies_match_direct_sum_at_zero_theta() {
    let settings = SimulationSettings::<f64>::default()
        .with_particle_count(400)
        .with_prefix_depth(2)
        .with_node_capacity(1 << 14)
        .with_theta(0.0)
        .with_eps(1e-2)
        .with_gravitational_constant(1.0);
    let mut sim = NBody::new(Box::new(GalaxiesClashing { seed: 3 }), SemiImplicitEuler::new());
    sim.handle(Command::Apply(settings)).unwrap();
    sim.update_forces().unwrap();

    let direct = DirectSum::from_settings(&settings);
    let (positions, data) = (sim.positions(), sim.particle_data());
    for i in (0..400).step_by(7) {
        let exact = direct.force_on(positions, data, i);
        assert_relative_eq!(data[i].force, exact, epsilon = 1e-6, max_relative = 1e-6);
    }
}

#[test]
fn execution_modes_produce_the_same_trajectory() {
    let base = SimulationSettings::<f32>::default()
        .with_particle_count(1_000)
        .with_prefix_depth(3)
        .with_node_capacity(1 << 15)
        .with_gravitational_constant(1e-6);
    let run = |mode| {
        let mut sim = NBody::new(Box::new(GalaxiesClashing::default()), SemiImplicitEuler::new());
        sim.handle(Command::Apply(base.with_mode(mode))).unwrap();
        for _ in 0..5 {
            sim.step_by(0.05).unwrap();
        }
        sim.positions().to_vec()
    };
    assert_eq!(run(ExecutionMode::Serial), run(ExecutionMode::Parallel));
}

#[test]
fn settings_tiers_follow_what_changed() {
    let base = SimulationSettings::<f32>::default();
    let tiers = [
        (base.with_theta(0.5), Some(Reconfigure::Rebind)),
        (base.with_stack_size(1024), Some(Reconfigure::Reinitialize)),
        (base.with_node_capacity(1 << 22), Some(Reconfigure::Reallocate)),
        (base, None),
    ];
    for (next, expected) in tiers {
        assert_eq!(next.changes_from(Some(&base)), expected);
    }
}

#[test]
fn reader_follows_the_simulation() {
    let mut sim = two_bodies();
    let snapshot = sim.snapshot();
    let mut reader = SnapshotReader::new();
    assert!(reader.poll(&snapshot).is_some());
    assert!(reader.poll(&snapshot).is_none());

    sim.step_by(0.5).unwrap();
    sim.step_by(0.5).unwrap();
    let points = reader.poll(&snapshot).unwrap();
    assert_eq!(points[1][0], sim.positions()[1].x as f32);
    assert_eq!(points[0][3], 1e11);
}
