//! The simulation driver: owns the particle buffers and the tree, applies
//! commands and runs one pipeline pass per tick.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use nalgebra::Vector3;
use web_time::Instant;

use crate::{
    barnes_hut::{BarnesHut, ForceParams},
    bounding_box::BoundingBox,
    error::SimError,
    integrator::{SemiImplicitEuler, StepTimer},
    layout::{Layout, ParticleSet, Uniform},
    octree::Octree,
    settings::{Reconfigure, SimulationSettings},
    shared::{Float, Integrator, ParticleData, Simulation},
    snapshot::PositionSnapshot,
};

pub enum Command<F: Float> {
    Start,
    Stop,
    Apply(SimulationSettings<F>),
    Regenerate,
    SetLayout(Box<dyn Layout<F>>),
}

impl<F: Float> fmt::Debug for Command<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => f.write_str("Start"),
            Command::Stop => f.write_str("Stop"),
            Command::Apply(settings) => f.debug_tuple("Apply").field(settings).finish(),
            Command::Regenerate => f.write_str("Regenerate"),
            Command::SetLayout(layout) => f.debug_tuple("SetLayout").field(&layout.name()).finish(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// Wall time of each pipeline stage, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageTimings {
    pub bounding_box_partials: f64,
    pub bounding_box_reduce: f64,
    pub grid_init: f64,
    pub build: f64,
    pub reduction: f64,
    pub normalization: f64,
    pub force: f64,
    pub integration: f64,
}

impl StageTimings {
    pub fn total(&self) -> f64 {
        self.bounding_box_partials
            + self.bounding_box_reduce
            + self.grid_init
            + self.build
            + self.reduction
            + self.normalization
            + self.force
            + self.integration
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepReport {
    pub timings: StageTimings,
    pub used_nodes: usize,
    pub allocated_nodes: usize,
    pub max_depth: u32,
    /// Seconds of simulated time this step advanced, 0 for a force-only pass.
    pub delta_time: f64,
}

impl StepReport {
    pub fn updates_per_second(&self) -> f64 {
        let total = self.timings.total();
        if total > 0.0 { 1000.0 / total } else { f64::INFINITY }
    }
}

/// Shared, thread-safe view of how the simulation is doing.
#[derive(Debug, Default)]
pub struct Telemetry {
    last: Mutex<Option<StepReport>>,
    crash: Mutex<Option<String>>,
    steps: AtomicU64,
}

impl Telemetry {
    fn record(&self, report: StepReport) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(report);
        }
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    fn set_crash(&self, message: String) {
        if let Ok(mut crash) = self.crash.lock() {
            *crash = Some(message);
        }
    }

    fn clear_crash(&self) {
        if let Ok(mut crash) = self.crash.lock() {
            *crash = None;
        }
    }

    pub fn last_report(&self) -> Option<StepReport> {
        self.last.lock().ok().and_then(|last| *last)
    }

    /// Message of the error that last stopped the simulation.
    pub fn crash(&self) -> Option<String> {
        self.crash.lock().ok().and_then(|crash| crash.clone())
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }
}

fn ms_since(t: &mut Instant) -> f64 {
    let now = Instant::now();
    let ms = now.duration_since(*t).as_secs_f64() * 1000.0;
    *t = now;
    ms
}

pub struct NBody<F: Float, I: Integrator<F> = SemiImplicitEuler> {
    settings: Option<SimulationSettings<F>>,
    layout: Box<dyn Layout<F>>,
    positions: Vec<Vector3<F>>,
    data: Vec<ParticleData<F>>,
    tree: Option<Octree<F>>,
    evaluator: BarnesHut<F>,
    integrator: I,
    timer: StepTimer,
    state: RunState,
    elapsed: F,
    snapshot: Arc<PositionSnapshot>,
    telemetry: Arc<Telemetry>,
}

impl<F: Float> NBody<F> {
    /// Unconfigured driver with a uniform cloud and semi-implicit Euler.
    pub fn with_defaults() -> Self {
        Self::new(Box::new(Uniform::default()), SemiImplicitEuler::new())
    }
}

impl<F: Float, I: Integrator<F>> NBody<F, I> {
    pub fn new(layout: Box<dyn Layout<F>>, integrator: I) -> Self {
        let defaults = SimulationSettings::default();
        Self {
            settings: None,
            layout,
            positions: Vec::new(),
            data: Vec::new(),
            tree: None,
            evaluator: BarnesHut::new(ForceParams::from(&defaults)),
            integrator,
            timer: StepTimer::new(),
            state: RunState::Idle,
            elapsed: F::zero(),
            snapshot: Arc::new(PositionSnapshot::new()),
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn settings(&self) -> Option<&SimulationSettings<F>> {
        self.settings.as_ref()
    }

    pub fn tree(&self) -> Option<&Octree<F>> {
        self.tree.as_ref()
    }

    pub fn layout_name(&self) -> &str {
        self.layout.name()
    }

    pub fn snapshot(&self) -> Arc<PositionSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Applies a command. A failing command stops the simulation and is
    /// reported through telemetry as well as returned.
    pub fn handle(&mut self, command: Command<F>) -> Result<(), SimError> {
        log::debug!("command: {command:?}");
        let result = self.dispatch(command);
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    fn dispatch(&mut self, command: Command<F>) -> Result<(), SimError> {
        match command {
            Command::Start => {
                if self.settings.is_none() {
                    return Err(SimError::NotConfigured);
                }
                self.telemetry.clear_crash();
                self.timer.reset();
                self.state = RunState::Running;
            }
            Command::Stop => self.state = RunState::Idle,
            Command::Apply(settings) => self.apply(settings)?,
            Command::Regenerate => {
                let settings = self.settings.ok_or(SimError::NotConfigured)?;
                self.regenerate(&settings)?;
            }
            Command::SetLayout(layout) => {
                self.layout = layout;
                if let Some(settings) = self.settings {
                    self.regenerate(&settings)?;
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, settings: SimulationSettings<F>) -> Result<(), SimError> {
        settings.validate()?;
        self.state = RunState::Idle;
        let Some(tier) = settings.changes_from(self.settings.as_ref()) else {
            return Ok(());
        };
        log::info!("applying settings: {tier:?}");

        match tier {
            Reconfigure::Reallocate => {
                let tree = Octree::new(
                    settings.node_capacity,
                    settings.prefix_depth,
                    settings.max_depth,
                );
                let set = self.generate(&settings)?;
                log::info!(
                    "allocated {} particles, {} nodes (~{})",
                    settings.particle_count,
                    settings.node_capacity,
                    crate::settings::format_bytes(settings.estimated_bytes())
                );
                self.tree = Some(tree);
                self.install(set);
            }
            Reconfigure::Reinitialize => {
                self.tree = Some(Octree::new(
                    settings.node_capacity,
                    settings.prefix_depth,
                    settings.max_depth,
                ));
            }
            Reconfigure::Rebind => {}
        }
        self.evaluator.params = ForceParams::from(&settings);
        self.settings = Some(settings);
        Ok(())
    }

    fn generate(&self, settings: &SimulationSettings<F>) -> Result<ParticleSet<F>, SimError> {
        let set = self
            .layout
            .generate(settings.particle_count, settings.default_mass)?;
        for actual in [set.positions.len(), set.data.len()] {
            if actual != settings.particle_count {
                return Err(SimError::ParticleCountMismatch {
                    expected: settings.particle_count,
                    actual,
                });
            }
        }
        Ok(set)
    }

    fn regenerate(&mut self, settings: &SimulationSettings<F>) -> Result<(), SimError> {
        let set = self.generate(settings)?;
        self.install(set);
        Ok(())
    }

    fn install(&mut self, set: ParticleSet<F>) {
        self.positions = set.positions;
        self.data = set.data;
        self.elapsed = F::zero();
        self.integrator.init();
        if let Some(tree) = self.tree.as_mut() {
            let mut bbox =
                BoundingBox::of_points(&self.positions).unwrap_or_else(BoundingBox::at_origin);
            bbox.adjust_to_fit_all();
            tree.prepare(&bbox);
        }
        self.snapshot.publish(&self.positions, &self.data);
        log::debug!("{} particles from layout '{}'", self.positions.len(), self.layout.name());
    }

    fn fail(&mut self, err: &SimError) {
        self.state = RunState::Idle;
        log::error!("simulation stopped: {err}");
        self.telemetry.set_crash(err.to_string());
    }

    /// Runs one step with the clamped wall-clock delta when running.
    pub fn tick(&mut self) -> Result<Option<StepReport>, SimError> {
        if self.state != RunState::Running {
            return Ok(None);
        }
        let settings = self.settings.ok_or(SimError::NotConfigured)?;
        let dt = self.timer.tick(settings.max_timestep);
        self.run_recorded(Some(dt)).map(Some)
    }

    fn run_recorded(&mut self, dt: Option<F>) -> Result<StepReport, SimError> {
        match self.run_pipeline(dt) {
            Ok(report) => {
                self.telemetry.record(report);
                Ok(report)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Bounding box, tree, forces and, given a `dt`, integration.
    fn run_pipeline(&mut self, dt: Option<F>) -> Result<StepReport, SimError> {
        let settings = self.settings.ok_or(SimError::NotConfigured)?;
        let tree = self.tree.as_mut().ok_or(SimError::NotConfigured)?;
        let mode = settings.mode;
        let mut timings = StageTimings::default();
        let mut t = Instant::now();

        let partials = BoundingBox::partials(&self.positions, settings.bounding_box_groups, mode);
        timings.bounding_box_partials = ms_since(&mut t);
        let mut bbox = BoundingBox::reduce(&partials);
        bbox.adjust_to_fit_all();
        timings.bounding_box_reduce = ms_since(&mut t);

        tree.prepare(&bbox);
        timings.grid_init = ms_since(&mut t);
        tree.insert(&self.positions, &self.data, mode)?;
        timings.build = ms_since(&mut t);
        tree.accumulate_mass(mode);
        timings.reduction = ms_since(&mut t);
        tree.normalize(settings.divide_by_mass_items_per_thread, mode);
        timings.normalization = ms_since(&mut t);

        self.evaluator.compute_forces(
            tree,
            &self.positions,
            &mut self.data,
            settings.barnes_hut_items_per_thread,
            mode,
        );
        timings.force = ms_since(&mut t);

        let mut delta_time = 0.0;
        if let Some(dt) = dt {
            self.integrator.integrate(
                &mut self.positions,
                &mut self.data,
                dt,
                settings.position_update_items_per_thread,
                mode,
            );
            timings.integration = ms_since(&mut t);
            self.elapsed += dt;
            delta_time = num_traits::cast::<F, f64>(dt).unwrap_or(0.0);
            self.snapshot.publish(&self.positions, &self.data);
        }

        Ok(StepReport {
            timings,
            used_nodes: tree.used_nodes(),
            allocated_nodes: tree.capacity(),
            max_depth: tree.max_depth_reached(),
            delta_time,
        })
    }
}

impl<F: Float, I: Integrator<F>> Simulation<F> for NBody<F, I> {
    fn init(&mut self) -> Result<(), SimError> {
        let settings = self.settings.ok_or(SimError::NotConfigured)?;
        self.regenerate(&settings)
    }

    fn update_forces(&mut self) -> Result<(), SimError> {
        self.run_recorded(None).map(|_| ())
    }

    fn step_by(&mut self, dt: F) -> Result<(), SimError> {
        self.run_recorded(Some(dt)).map(|_| ())
    }

    fn elapsed(&self) -> F {
        self.elapsed
    }

    fn positions(&self) -> &[Vector3<F>] {
        &self.positions
    }

    fn particle_data(&self) -> &[ParticleData<F>] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::Fixed, octree::prefix_len, snapshot::SnapshotReader};

    fn small() -> SimulationSettings<f64> {
        SimulationSettings::default()
            .with_particle_count(200)
            .with_prefix_depth(2)
            .with_max_depth(16)
            .with_node_capacity(1 << 14)
            .with_bounding_box_groups(8)
    }

    #[test]
    fn start_requires_settings() {
        let mut sim = NBody::<f64>::with_defaults();
        assert!(matches!(sim.handle(Command::Start), Err(SimError::NotConfigured)));
        assert_eq!(sim.state(), RunState::Idle);
        assert!(sim.telemetry().crash().is_some());
    }

    #[test]
    fn apply_generates_and_tick_steps() {
        let mut sim = NBody::<f64>::with_defaults();
        sim.handle(Command::Apply(small())).unwrap();
        assert_eq!(sim.positions().len(), 200);
        assert!(sim.tick().unwrap().is_none());

        sim.handle(Command::Start).unwrap();
        let report = sim.tick().unwrap().unwrap();
        assert!(report.used_nodes >= prefix_len(2));
        assert_eq!(report.allocated_nodes, 1 << 14);
        assert!(report.delta_time <= 0.1);
        assert_eq!(sim.telemetry().steps(), 1);
        assert_eq!(sim.telemetry().last_report(), Some(report));
    }

    #[test]
    fn theta_change_keeps_particles() {
        let mut sim = NBody::<f64>::with_defaults();
        sim.handle(Command::Apply(small())).unwrap();
        sim.step_by(0.01).unwrap();
        let moved = sim.positions().to_vec();
        sim.handle(Command::Apply(small().with_theta(0.9))).unwrap();
        assert_eq!(sim.positions(), &moved[..]);
        assert_eq!(sim.evaluator.params.theta, 0.9);
    }

    #[test]
    fn apply_stops_the_run() {
        let mut sim = NBody::<f64>::with_defaults();
        sim.handle(Command::Apply(small())).unwrap();
        sim.handle(Command::Start).unwrap();
        sim.handle(Command::Apply(small().with_eps(0.5))).unwrap();
        assert_eq!(sim.state(), RunState::Idle);
    }

    #[test]
    fn overflow_stops_and_reports() {
        let settings = small().with_node_capacity(prefix_len(2));
        let mut sim = NBody::<f64>::with_defaults();
        sim.handle(Command::Apply(settings)).unwrap();
        sim.handle(Command::Start).unwrap();
        let err = sim.tick().unwrap_err();
        assert!(matches!(err, SimError::TreeCapacityExceeded { .. }));
        assert_eq!(sim.state(), RunState::Idle);
        assert!(sim.telemetry().crash().unwrap().contains("exhausted"));
    }

    #[test]
    fn short_layout_is_rejected() {
        let mut set = ParticleSet::default();
        set.push(Vector3::zeros(), ParticleData::at_rest(1.0));
        let mut sim = NBody::<f64>::new(Box::new(Fixed(set)), SemiImplicitEuler::new());
        let err = sim.handle(Command::Apply(small())).unwrap_err();
        assert!(matches!(
            err,
            SimError::ParticleCountMismatch { expected: 200, actual: 1 }
        ));
        assert!(sim.settings().is_none());
    }

    #[test]
    fn invalid_settings_are_rejected_eagerly() {
        let mut sim = NBody::<f32>::with_defaults();
        let err = sim.handle(Command::Apply(SimulationSettings::default().with_theta(-1.0)));
        assert!(matches!(err, Err(SimError::InvalidSettings(_))));
        assert!(sim.settings().is_none());
    }

    #[test]
    fn steps_are_published() {
        let mut sim = NBody::<f32>::with_defaults();
        let snapshot = sim.snapshot();
        let mut reader = SnapshotReader::new();
        sim.handle(Command::Apply(
            SimulationSettings::default()
                .with_particle_count(64)
                .with_prefix_depth(1)
                .with_node_capacity(4096),
        ))
        .unwrap();
        assert_eq!(reader.poll(&snapshot).map(<[_]>::len), Some(64));
        sim.step_by(0.01).unwrap();
        let points = reader.poll(&snapshot).unwrap();
        assert_eq!(points[5][0], sim.positions()[5].x);
    }

    #[test]
    fn set_layout_regenerates() {
        let mut sim = NBody::<f64>::with_defaults();
        sim.handle(Command::Apply(small())).unwrap();
        let before = sim.positions().to_vec();
        sim.handle(Command::SetLayout(Box::new(crate::layout::Galaxy::default())))
            .unwrap();
        assert_eq!(sim.layout_name(), "galaxy");
        assert_ne!(sim.positions(), &before[..]);
        assert_eq!(sim.elapsed(), 0.0);
    }
}
