//! git-ci Core
//!
//! Normalized pipeline model, execution results, events and error handling
//! for git-ci. Provider parsers produce these types; the runners and the
//! scheduler consume them.

pub mod duration;
pub mod error;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod run;

pub use error::{Error, Result};
pub use events::{Event, EventSink, OutputStream};
pub use ids::RunId;
pub use pipeline::{
    BackoffStrategy, ContainerSpec, EnvVars, Job, Jobs, Pipeline, RetryPolicy, Step, StepAction,
};
pub use run::{JobResult, JobSummary, PipelineRun, Status, StepResult};
