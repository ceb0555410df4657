use bhlib::{
    Command, ExecutionMode, NBody, SimError, SimulationSettings,
    brute_force::DirectSum,
    integrator::SemiImplicitEuler,
    layout::{Galaxy, GalaxiesClashing, Layout, Uniform},
    settings::format_bytes,
    shared::Simulation,
};
use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    Uniform,
    Galaxy,
    GalaxiesClashing,
}

/// Headless Barnes-Hut n-body runner.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(short = 'n', long, default_value_t = 66048)]
    particles: usize,
    #[arg(short, long, default_value_t = 100)]
    steps: usize,
    #[arg(short, long, value_enum, default_value_t = LayoutArg::GalaxiesClashing)]
    layout: LayoutArg,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 0.3)]
    theta: f32,
    #[arg(long, default_value_t = 1e-3)]
    eps: f32,
    #[arg(long, default_value_t = 6.6743e-11)]
    gravity: f32,
    #[arg(long, default_value_t = 5)]
    prefix_depth: u32,
    #[arg(long, default_value_t = 20)]
    max_depth: u32,
    #[arg(long)]
    node_capacity: Option<usize>,
    /// Fixed step length in seconds; also the clamp in realtime mode.
    #[arg(long, default_value_t = 0.1)]
    timestep: f32,
    /// Step with the measured wall-clock delta instead of a fixed one.
    #[arg(long)]
    realtime: bool,
    #[arg(long)]
    serial: bool,
    /// Compare the first step's forces on this many particles with a direct sum.
    #[arg(long)]
    verify: Option<usize>,
}

impl Args {
    fn settings(&self) -> SimulationSettings<f32> {
        let defaults = SimulationSettings::<f32>::default();
        let node_capacity = self.node_capacity.unwrap_or(defaults.node_capacity);
        defaults
            .with_particle_count(self.particles)
            .with_theta(self.theta)
            .with_eps(self.eps)
            .with_gravitational_constant(self.gravity)
            .with_prefix_depth(self.prefix_depth)
            .with_max_depth(self.max_depth)
            .with_node_capacity(node_capacity)
            .with_max_timestep(self.timestep)
            .with_mode(if self.serial {
                ExecutionMode::Serial
            } else {
                ExecutionMode::Parallel
            })
    }

    fn layout(&self) -> Box<dyn Layout<f32>> {
        match self.layout {
            LayoutArg::Uniform => Box::new(Uniform { seed: self.seed }),
            LayoutArg::Galaxy => Box::new(Galaxy {
                seed: self.seed,
                ..Galaxy::default()
            }),
            LayoutArg::GalaxiesClashing => Box::new(GalaxiesClashing { seed: self.seed }),
        }
    }
}

fn init_logger() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .chain(fern::Output::call(console_log::log))
                .apply()
                .unwrap();
            std::panic::set_hook(Box::new(console_error_panic_hook::hook));
            log::info!("Logger initialized");
        } else {
            env_logger::init();
        }
    }
}

fn verify(sim: &NBody<f32>, settings: &SimulationSettings<f32>, samples: usize) {
    let direct = DirectSum::from_settings(settings);
    let (positions, data) = (sim.positions(), sim.particle_data());
    let stride = (positions.len() / samples.max(1)).max(1);
    let worst = (0..positions.len())
        .step_by(stride)
        .take(samples)
        .map(|i| {
            let exact = direct.force_on(positions, data, i);
            (data[i].force - exact).norm() / exact.norm().max(f32::MIN_POSITIVE)
        })
        .fold(0.0f32, f32::max);
    log::info!("max relative force error over {samples} particles: {worst:.3e}");
}

fn main() -> Result<(), SimError> {
    init_logger();
    let args = Args::parse();
    let settings = args.settings();
    log::info!(
        "{} particles, layout {:?}, estimated memory {}",
        settings.particle_count,
        args.layout,
        format_bytes(settings.estimated_bytes())
    );

    let mut sim = NBody::new(args.layout(), SemiImplicitEuler::new());
    sim.handle(Command::Apply(settings))?;

    if let Some(samples) = args.verify {
        sim.update_forces()?;
        verify(&sim, &settings, samples);
    }

    let start = web_time::Instant::now();
    if args.realtime {
        sim.handle(Command::Start)?;
    }
    for step in 0..args.steps {
        if args.realtime {
            sim.tick()?;
        } else {
            sim.step_by(settings.max_timestep)?;
        }
        if let Some(report) = sim.telemetry().last_report() {
            log::debug!(
                "step {step}: {:.2} ms ({:.1} ups), {} / {} nodes, depth {}",
                report.timings.total(),
                report.updates_per_second(),
                report.used_nodes,
                report.allocated_nodes,
                report.max_depth
            );
        }
    }
    sim.handle(Command::Stop)?;

    let elapsed = start.elapsed();
    println!(
        "Elapsed: {:?} for {} steps ({:.3} s simulated)",
        elapsed,
        args.steps,
        sim.elapsed()
    );
    if let Some(report) = sim.telemetry().last_report() {
        println!("Last step: {:#?}", report.timings);
    }
    Ok(())
}
