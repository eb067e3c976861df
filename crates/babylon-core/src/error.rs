//! Error kinds surfaced by the run.
//!
//! Tool failures never travel through these types: they are captured inside
//! the agent turn as `is_error` tool results so the model can react.

use thiserror::Error;

/// Workflow-level failures. Anything uncaught at the engine boundary wraps
/// into `Workflow` and the run completes with status `failed`.
#[derive(Debug, Error)]
pub enum BabylonError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider error: {0}")]
    Provider(#[from] crate::ai::ProviderError),

    #[error("persistence error: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("run cancelled")]
    Cancelled,

    #[error("workflow error: {0}")]
    Workflow(String),
}

pub type Result<T> = std::result::Result<T, BabylonError>;
