//! Job selection, validation and scheduling for git-ci.

pub mod dag;
pub mod factory;
pub mod scheduler;
pub mod selection;
pub mod validate;

pub use dag::{DagBuilder, DagError, JobDag};
pub use factory::{DefaultRunnerFactory, RunnerFactory};
pub use scheduler::{ExecutionMode, JobOrdering, Scheduler, SchedulerConfig};
pub use selection::{JobSelector, matches_pattern};
pub use validate::{ValidationError, Validator};
