//! Pipeline error classification.
//!
//! Components report failures as `anyhow::Error` with context; the
//! orchestrator folds them into a `PipelineError`, and only `main`
//! translates that into a process exit code.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing input file: {0}")]
    MissingInput(String),

    #[error("Taxonomy load failure: {0}")]
    Taxonomy(String),

    #[error("Reference cache build failure: {0}")]
    CacheBuild(String),

    #[error("Alignment stream error: {0}")]
    AlignmentStream(String),

    #[error("Empty candidate set: {0}")]
    EmptyCandidates(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Exit code contract from the CLI surface:
    /// 0 success, 2 config, 3 missing input, 4 taxonomy, 5 cache,
    /// 6 alignment stream, 7 empty candidates, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::MissingInput(_) => 3,
            PipelineError::Taxonomy(_) => 4,
            PipelineError::CacheBuild(_) => 5,
            PipelineError::AlignmentStream(_) => 6,
            PipelineError::EmptyCandidates(_) => 7,
            PipelineError::Cancelled => 130,
            PipelineError::Io(_) | PipelineError::Other(_) => 1,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(p) => p,
            Err(e) => PipelineError::Other(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineError::Config("x".into()).exit_code(), 2);
        assert_eq!(PipelineError::MissingInput("x".into()).exit_code(), 3);
        assert_eq!(PipelineError::Taxonomy("x".into()).exit_code(), 4);
        assert_eq!(PipelineError::CacheBuild("x".into()).exit_code(), 5);
        assert_eq!(PipelineError::AlignmentStream("x".into()).exit_code(), 6);
        assert_eq!(PipelineError::EmptyCandidates("x".into()).exit_code(), 7);
        assert_eq!(PipelineError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_anyhow_round_trip_preserves_class() {
        let inner: anyhow::Error = PipelineError::EmptyCandidates("floor reached".into()).into();
        let back: PipelineError = inner.into();
        assert_eq!(back.exit_code(), 7);
    }
}
