//! Application-level error type and process exit codes.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::pipeline::error::PipelineError;
use crate::registry::RegistryError;

/// Exit codes: 0 success, 1 runtime failure, 2 argument error (produced by
/// clap), 3 configuration/validation/assembly failure.
pub const EXIT_RUNTIME: i32 = 1;
pub const EXIT_CONFIG: i32 = 3;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Registry(_) | Self::Io { .. } => EXIT_CONFIG,
            Self::Pipeline(_) => EXIT_RUNTIME,
        }
    }
}
