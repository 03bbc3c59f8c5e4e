//! Run and execution result types.

use crate::error::{Error, Result};
use crate::ids::RunId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failed | Status::Skipped | Status::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::Skipped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    pub name: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Attempts made beyond the first.
    pub retries: u32,
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Mark the step as running now.
    pub fn start(&mut self) {
        self.status = Status::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record the terminal status and duration.
    pub fn finish(&mut self, status: Status) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        let mut result = Self::new(name);
        result.finish(Status::Skipped);
        result
    }
}

/// Outcome of running one job's steps on a runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobSummary {
    pub job: String,
    pub runner: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepResult>,
}

impl JobSummary {
    pub fn new(job: impl Into<String>, runner: impl Into<String>, total_steps: usize) -> Self {
        Self {
            job: job.into(),
            runner: runner.into(),
            total_steps,
            success: true,
            ..Default::default()
        }
    }

    /// Count a finished step by its status.
    pub fn record(&mut self, step: StepResult) {
        match step.status {
            Status::Success => self.completed_steps += 1,
            Status::Failed => self.failed_steps += 1,
            Status::Skipped => self.skipped_steps += 1,
            _ => {}
        }
        self.steps.push(step);
    }

    /// Mark the job failed with a message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.errors.push(message.into());
    }

    /// `Ok` when the job succeeded, `Error::JobFailed` otherwise.
    pub fn into_result(self) -> Result<JobSummary> {
        if self.success {
            Ok(self)
        } else {
            let message = if self.errors.is_empty() {
                "job failed".to_string()
            } else {
                self.errors.join("; ")
            };
            Err(Error::JobFailed {
                job: self.job,
                message,
            })
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    pub name: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// The job is marked `allow_failure`.
    pub allow_failure: bool,
    pub error: Option<String>,
    pub summary: Option<JobSummary>,
}

impl JobResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_status(name: impl Into<String>, status: Status, error: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            error,
            ..Default::default()
        }
    }
}

/// Aggregated outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    #[schemars(with = "String")]
    pub id: RunId,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Run-level continue-on-error was requested.
    pub continue_on_error: bool,
    pub jobs: BTreeMap<String, JobResult>,
    /// First job failure observed, in completion order.
    pub first_failure: Option<String>,
}

impl PipelineRun {
    pub fn new(pipeline: impl Into<String>, continue_on_error: bool) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            continue_on_error,
            jobs: BTreeMap::new(),
            first_failure: None,
        }
    }

    pub fn record(&mut self, result: JobResult) {
        if result.status == Status::Failed && self.first_failure.is_none() {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "job failed".to_string());
            self.first_failure = Some(format!("job '{}' failed: {}", result.name, message));
        }
        self.jobs.insert(result.name.clone(), result);
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }

    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.jobs.get(name)
    }

    fn count(&self, status: Status) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(Status::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Status::Skipped)
    }

    pub fn cancelled(&self) -> usize {
        self.count(Status::Cancelled)
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    /// A run fails when any job failed and continuation was not requested.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 || self.continue_on_error
    }

    /// The pipeline verdict as a `Result`.
    pub fn outcome(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(Error::PipelineFailed {
            failed: self.failed(),
            total: self.total(),
            first: self
                .first_failure
                .clone()
                .unwrap_or_else(|| "job failed".to_string()),
        })
    }
}
