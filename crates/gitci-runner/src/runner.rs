//! Core runner trait and types.

use crate::condition::{ConditionEvaluator, LiteralConditions};
use async_trait::async_trait;
use gitci_core::pipeline::{EnvVars, Job, Pipeline, Step};
use gitci_core::run::{JobSummary, StepResult};
use gitci_core::{Error, EventSink, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Execution backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerType {
    /// Native subprocesses on the host.
    #[default]
    Process,
    /// One Docker container per job.
    Container,
}

impl RunnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerType::Process => "process",
            RunnerType::Container => "container",
        }
    }
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunnerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" | "bash" | "shell" | "native" => Ok(RunnerType::Process),
            "container" | "docker" => Ok(RunnerType::Container),
            other => Err(format!("Unknown runner: {}", other)),
        }
    }
}

/// When the container backend pulls images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "true" => Ok(PullPolicy::Always),
            "if-not-present" | "missing" => Ok(PullPolicy::IfNotPresent),
            "never" | "false" => Ok(PullPolicy::Never),
            other => Err(format!("Unknown pull policy: {}", other)),
        }
    }
}

/// Trait for job execution backends.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute every step of a job in declaration order.
    ///
    /// Step failures are reported through the summary. `Err` means the job
    /// could not be executed at all.
    async fn run_job(&self, job: &Job, workdir: &Path) -> Result<JobSummary>;

    /// Execute a single step with an already merged environment.
    ///
    /// Returns `Err` when the step failed after its retry policy ran out.
    async fn run_step(&self, step: &Step, env: &EnvVars, workdir: &Path) -> Result<StepResult>;

    /// Release everything this runner allocated.
    async fn cleanup(&self) -> Result<()>;

    fn runner_type(&self) -> RunnerType;
}

/// Configuration shared by every runner of one pipeline run.
#[derive(Clone)]
pub struct RunnerConfig {
    pub verbose: bool,
    pub dry_run: bool,
    pub pull_policy: PullPolicy,
    /// Image used when nothing in the job resolves to one.
    pub default_image: String,
    /// Shell used when neither step, job nor pipeline names one.
    pub default_shell: Option<String>,
    /// Job deadline when the job sets none. 0 means unbounded.
    pub timeout_minutes: u64,
    /// Start process environments from the host environment.
    pub inherit_host_env: bool,
    pub pipeline_env: EnvVars,
    pub pipeline_shell: Option<String>,
    pub pipeline_working_directory: Option<String>,
    /// Run-level overrides from the command line and config file.
    pub overrides: EnvVars,
    pub conditions: Arc<dyn ConditionEvaluator>,
    pub events: EventSink,
}

impl RunnerConfig {
    /// Carry pipeline-wide environment and defaults into the config.
    pub fn with_pipeline(mut self, pipeline: &Pipeline) -> Self {
        self.pipeline_env = pipeline.env.clone();
        self.pipeline_shell = pipeline.defaults.shell.clone();
        self.pipeline_working_directory = pipeline.defaults.working_directory.clone();
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Effective deadline for a job.
    pub fn job_timeout(&self, job: &Job) -> Option<Duration> {
        let minutes = if job.timeout_minutes > 0 {
            job.timeout_minutes as u64
        } else {
            self.timeout_minutes
        };
        (minutes > 0).then(|| Duration::from_secs(minutes * 60))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            dry_run: false,
            pull_policy: PullPolicy::default(),
            default_image: crate::images::DEFAULT_IMAGE.to_string(),
            default_shell: None,
            timeout_minutes: 30,
            inherit_host_env: true,
            pipeline_env: EnvVars::new(),
            pipeline_shell: None,
            pipeline_working_directory: None,
            overrides: EnvVars::new(),
            conditions: Arc::new(LiteralConditions),
            events: EventSink::disabled(),
        }
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("verbose", &self.verbose)
            .field("dry_run", &self.dry_run)
            .field("pull_policy", &self.pull_policy)
            .field("default_image", &self.default_image)
            .field("default_shell", &self.default_shell)
            .field("timeout_minutes", &self.timeout_minutes)
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Absolute, existing job directory.
pub async fn resolve_workdir(workdir: &Path) -> Result<PathBuf> {
    let invalid = |message: String| Error::InvalidWorkdir {
        path: workdir.display().to_string(),
        message,
    };
    let resolved = tokio::fs::canonicalize(workdir)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_type_parsing() {
        assert_eq!("docker".parse::<RunnerType>().unwrap(), RunnerType::Container);
        assert_eq!("bash".parse::<RunnerType>().unwrap(), RunnerType::Process);
        assert!("podman".parse::<RunnerType>().is_err());
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("false".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
    }

    #[test]
    fn test_job_timeout_prefers_job_value() {
        let config = RunnerConfig::default();
        let mut job = Job::new("build");
        assert_eq!(config.job_timeout(&job), Some(Duration::from_secs(30 * 60)));

        job.timeout_minutes = 5;
        assert_eq!(config.job_timeout(&job), Some(Duration::from_secs(300)));

        let unbounded = RunnerConfig {
            timeout_minutes: 0,
            ..Default::default()
        };
        job.timeout_minutes = 0;
        assert_eq!(unbounded.job_timeout(&job), None);
    }
}
