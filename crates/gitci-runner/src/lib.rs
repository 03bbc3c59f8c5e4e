//! Job execution backends for git-ci.
//!
//! A [`Runner`] executes one job's steps. [`ShellRunner`] spawns host
//! subprocesses; [`ContainerRunner`] runs the whole job as a generated
//! script inside a Docker container.

pub mod actions;
pub mod condition;
pub mod container;
pub mod env;
pub mod images;
pub mod retry;
pub mod runner;
pub mod script;
pub mod shell;

pub use condition::{ConditionEvaluator, LiteralConditions};
pub use container::ContainerRunner;
pub use images::{DEFAULT_IMAGE, resolve_image};
pub use retry::{AttemptState, RetryMachine};
pub use runner::{PullPolicy, Runner, RunnerConfig, RunnerType};
pub use shell::ShellRunner;
