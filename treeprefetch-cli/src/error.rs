//! CLI error type.

use std::fmt;

use treeprefetch::PrefetchError;

#[derive(Debug)]
pub enum CliError {
    /// Bad arguments or configuration.
    Config(String),
    /// The engine failed.
    Prefetch(PrefetchError),
    /// The Tokio runtime could not be built.
    Runtime(std::io::Error),
    /// The simulation did not finish in time.
    Timeout(u64),
    Output(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Prefetch(e) => write!(f, "Prefetch error: {}", e),
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
            CliError::Timeout(secs) => {
                write!(f, "Prefetch did not complete within {} seconds", secs)
            }
            CliError::Output(msg) => write!(f, "Output error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<PrefetchError> for CliError {
    fn from(e: PrefetchError) -> Self {
        CliError::Prefetch(e)
    }
}

impl CliError {
    /// Exit code for the error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Timeout(_) => 3,
            _ => 1,
        }
    }
}
