use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by a likelihood when it is evaluated.
///
/// A recoverable error means the point lies outside the region where the
/// likelihood is defined, and the sampler treats it like a point with zero
/// posterior density. Anything else aborts the run.
#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error("point is outside the domain of the likelihood: {0}")]
    Domain(String),
    #[error("likelihood evaluation failed: {0}")]
    Fatal(String),
}

impl LikelihoodError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LikelihoodError::Domain(_))
    }
}

#[derive(Error, Debug)]
pub enum McmcError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("chain {chain}: no starting point with finite posterior found after {attempts} attempts")]
    Startup { chain: u64, attempts: u64 },
    #[error("unusable checkpoint: {0}. Restart with `force` or use a compatible version")]
    CheckpointFormat(String),
    #[error("likelihood `{name}` failed")]
    Likelihood {
        name: String,
        #[source]
        source: LikelihoodError,
    },
    #[error("chain {chain} rejected {rejections} proposals in a row")]
    ChainStuck { chain: u64, rejections: u64 },
    #[error("worker for chain {chain} failed: {message}")]
    WorkerFailed { chain: u64, message: String },
    #[error("output {0:?} already exists and there is no checkpoint to resume from")]
    ExistingOutput(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Output(#[from] anyhow::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, McmcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_recoverable() {
        assert!(LikelihoodError::Domain("negative mass".into()).is_recoverable());
        assert!(!LikelihoodError::Fatal("solver diverged".into()).is_recoverable());
    }

    #[test]
    fn startup_error_reports_attempts() {
        let err = McmcError::Startup {
            chain: 2,
            attempts: 40,
        };
        assert!(err.to_string().contains("40 attempts"));
    }
}
