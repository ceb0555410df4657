pub mod barnes_hut;
pub mod bounding_box;
pub mod brute_force;
pub mod driver;
pub mod error;
pub mod integrator;
pub mod layout;
pub mod octree;
pub mod settings;
pub mod shared;
pub mod snapshot;

pub use driver::{Command, NBody, RunState, StepReport, Telemetry};
pub use error::SimError;
pub use settings::{ExecutionMode, Reconfigure, SimulationSettings};
