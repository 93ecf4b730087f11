use regress_core::CacheError;
use std::io;
use thiserror::Error;

/// Per-job failure. Every variant ends with the job recorded as errored; none
/// of them aborts the suite.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("commission failed: {0}")]
    Commission(String),
    #[error("job submission failed after {attempts} attempts")]
    Scheduler { attempts: u32 },
    #[error("execution {0}")]
    Execution(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<CacheError> for RunError {
    fn from(err: CacheError) -> Self {
        RunError::Commission(err.to_string())
    }
}
