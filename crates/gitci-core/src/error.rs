//! Error types for git-ci.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline validation failed with {} error(s)", .0.len())]
    Validation(Vec<String>),

    #[error("No jobs selected: {0}")]
    NoJobsSelected(String),

    // Runner errors
    #[error("{runner} runner unavailable: {message}")]
    RunnerUnavailable { runner: String, message: String },

    #[error("Invalid working directory {path}: {message}")]
    InvalidWorkdir { path: String, message: String },

    // Step errors
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {minutes} minutes")]
    StepTimeout { minutes: u64 },

    #[error("All {attempts} attempts failed, last error: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // Job errors
    #[error("Job '{job}' failed: {message}")]
    JobFailed { job: String, message: String },

    #[error("Job timeout after {minutes} minutes")]
    JobTimeout { minutes: u64 },

    #[error("Container exited with status {exit_code}")]
    ContainerExited { exit_code: i64 },

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Cleanup completed with {} error(s)", .failures.len())]
    Cleanup { failures: Vec<String> },

    // Pipeline run errors
    #[error("Pipeline failed ({failed}/{total} jobs failed): {first}")]
    PipelineFailed {
        failed: usize,
        total: usize,
        first: String,
    },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Exit code carried by a step failure, looking through retry wrappers.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::StepFailed { exit_code, .. } => Some(*exit_code),
            Error::RetriesExhausted { source, .. } => source.exit_code(),
            _ => None,
        }
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::StepTimeout { .. } | Error::JobTimeout { .. } => true,
            Error::RetriesExhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
