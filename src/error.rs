use std::error::Error;

use thiserror::Error;

/// Every failure the engine can report to its driver.
#[derive(Debug, Error)]
pub enum SimError {
    /// The octree needed more node slots than the pool was configured with.
    #[error("octree node pool exhausted: {used} nodes required, capacity is {capacity}")]
    TreeCapacityExceeded { used: usize, capacity: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// An external collaborator (particle layout, consumer) failed.
    #[error("collaborator failure{}: {source}", describe_context(.context))]
    Collaborator {
        context: Option<String>,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    #[error("layout produced {actual} particles, expected {expected}")]
    ParticleCountMismatch { expected: usize, actual: usize },

    #[error("simulation has not been configured")]
    NotConfigured,
}

impl SimError {
    pub fn collaborator<E>(source: E, context: impl Into<String>) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        SimError::Collaborator {
            context: Some(context.into()),
            source: source.into(),
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SimError::InvalidSettings(msg.into())
    }
}

fn describe_context(context: &Option<String>) -> String {
    match context {
        Some(context) => format!(" while {context}"),
        None => String::new(),
    }
}
