//! Main scheduler orchestration.

use crate::dag::DagBuilder;
use crate::factory::RunnerFactory;
use crate::selection::JobSelector;
use chrono::Utc;
use gitci_core::pipeline::{Job, Pipeline};
use gitci_core::run::{JobResult, PipelineRun, Status};
use gitci_core::{Error, EventSink, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Whether jobs respect `needs` when they are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrdering {
    /// Run the selection as declared, ignoring `needs`.
    #[default]
    Unordered,
    /// Run in topological layers; dependents of a failed job are skipped.
    Needs,
}

impl std::str::FromStr for JobOrdering {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unordered" => Ok(JobOrdering::Unordered),
            "needs" => Ok(JobOrdering::Needs),
            other => Err(format!("Unknown ordering: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel { max_parallel: usize },
}

impl ExecutionMode {
    /// Parallel mode. A limit of 0 means one job per CPU.
    pub fn parallel(max_parallel: usize) -> Self {
        let max_parallel = if max_parallel == 0 {
            num_cpus::get()
        } else {
            max_parallel
        };
        ExecutionMode::Parallel { max_parallel }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    pub ordering: JobOrdering,
    /// Keep going after job failures; failures then no longer fail the run.
    pub continue_on_error: bool,
    pub workdir: PathBuf,
    pub events: EventSink,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            ordering: JobOrdering::default(),
            continue_on_error: false,
            workdir: PathBuf::from("."),
            events: EventSink::disabled(),
        }
    }
}

/// Runs a selection of jobs and aggregates their results.
pub struct Scheduler {
    factory: Arc<dyn RunnerFactory>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(factory: Arc<dyn RunnerFactory>, config: SchedulerConfig) -> Self {
        Self { factory, config }
    }

    /// Select jobs from a pipeline and run them.
    pub async fn run(&self, pipeline: &Pipeline, selector: &JobSelector) -> Result<PipelineRun> {
        let jobs: Vec<Job> = selector.select(pipeline)?.into_iter().cloned().collect();
        self.run_jobs(&pipeline.name, jobs).await
    }

    /// Run an already selected set of jobs.
    pub async fn run_jobs(&self, pipeline: &str, jobs: Vec<Job>) -> Result<PipelineRun> {
        if jobs.is_empty() {
            return Err(Error::NoJobsSelected("no jobs to run".to_string()));
        }

        let mut run = PipelineRun::new(pipeline, self.config.continue_on_error);
        info!(
            run_id = %run.id,
            pipeline = %pipeline,
            jobs = jobs.len(),
            mode = ?self.config.mode,
            ordering = ?self.config.ordering,
            "Starting pipeline run"
        );

        match self.config.ordering {
            JobOrdering::Unordered => {
                self.dispatch(jobs, &mut run).await;
            }
            JobOrdering::Needs => self.run_layers(jobs, &mut run).await?,
        }

        run.finish();
        info!(
            run_id = %run.id,
            succeeded = run.succeeded(),
            failed = run.failed(),
            total = run.total(),
            duration_ms = run.duration_ms,
            "Pipeline run finished"
        );
        Ok(run)
    }

    async fn run_layers(&self, jobs: Vec<Job>, run: &mut PipelineRun) -> Result<()> {
        let dag = DagBuilder::new()
            .build(&jobs)
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;
        let layers: Vec<Vec<String>> = dag
            .layers()
            .iter()
            .map(|layer| layer.iter().map(|n| n.name.clone()).collect())
            .collect();
        let mut by_name: HashMap<String, Job> =
            jobs.into_iter().map(|j| (j.name.clone(), j)).collect();

        let mut aborted = false;
        for (depth, layer) in layers.into_iter().enumerate() {
            let mut ready = Vec::new();
            for name in layer {
                let Some(job) = by_name.remove(&name) else {
                    continue;
                };
                if aborted {
                    run.record(cancelled(&job));
                    continue;
                }
                if let Some(dependency) = blocking_dependency(&job, run) {
                    info!(job = %job.name, dependency = %dependency, "Skipping job, dependency did not succeed");
                    let mut result = JobResult::with_status(
                        &job.name,
                        Status::Skipped,
                        Some(format!("dependency '{}' did not succeed", dependency)),
                    );
                    result.allow_failure = job.allow_failure;
                    run.record(result);
                    continue;
                }
                ready.push(job);
            }

            debug!(layer = depth, jobs = ready.len(), "Dispatching layer");
            if self.dispatch(ready, run).await {
                aborted = true;
            }
        }
        Ok(())
    }

    /// Run a batch with the configured mode. Returns whether a failure
    /// aborted the run.
    async fn dispatch(&self, jobs: Vec<Job>, run: &mut PipelineRun) -> bool {
        if jobs.is_empty() {
            return false;
        }
        match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(jobs, run).await,
            ExecutionMode::Parallel { max_parallel } => {
                self.run_parallel(jobs, max_parallel, run).await
            }
        }
    }

    async fn run_sequential(&self, jobs: Vec<Job>, run: &mut PipelineRun) -> bool {
        info!(jobs = jobs.len(), "Running jobs sequentially");
        let mut aborted = false;

        for job in jobs {
            if aborted {
                run.record(cancelled(&job));
                continue;
            }

            let result = execute_job(
                self.factory.clone(),
                job.clone(),
                self.config.workdir.clone(),
                self.config.events.clone(),
            )
            .await;
            let failed = result.status == Status::Failed;
            run.record(result);

            if failed && !self.tolerates_failure(&job) {
                warn!(job = %job.name, "Job failed, aborting remaining jobs");
                aborted = true;
            }
        }
        aborted
    }

    async fn run_parallel(&self, jobs: Vec<Job>, max_parallel: usize, run: &mut PipelineRun) -> bool {
        let max_parallel = max_parallel.max(1);
        info!(jobs = jobs.len(), max_parallel, "Running jobs in parallel");

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let (tx, mut rx) = mpsc::channel::<JobResult>(jobs.len());
        let mut join_set = JoinSet::new();
        let mut pending: HashMap<String, bool> = HashMap::new();

        for job in jobs {
            pending.insert(job.name.clone(), self.tolerates_failure(&job));

            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let factory = self.factory.clone();
            let workdir = self.config.workdir.clone();
            let events = self.config.events.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = execute_job(factory, job, workdir, events).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut aborted = false;
        let mut received = HashSet::new();
        while let Some(result) = rx.recv().await {
            let tolerated = pending.get(&result.name).copied().unwrap_or(false);
            if result.status == Status::Failed && !tolerated {
                aborted = true;
            }
            received.insert(result.name.clone());
            run.record(result);
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task failed");
            }
        }

        // Jobs whose task died without reporting
        for (name, tolerated) in pending {
            if received.contains(&name) {
                continue;
            }
            run.record(JobResult::with_status(
                &name,
                Status::Failed,
                Some("job task terminated unexpectedly".to_string()),
            ));
            if !tolerated {
                aborted = true;
            }
        }

        aborted
    }

    fn tolerates_failure(&self, job: &Job) -> bool {
        self.config.continue_on_error || job.allow_failure || job.continue_on_error
    }
}

/// Create a runner, run the job, clean up and describe the outcome.
async fn execute_job(
    factory: Arc<dyn RunnerFactory>,
    job: Job,
    workdir: PathBuf,
    events: EventSink,
) -> JobResult {
    let start = std::time::Instant::now();
    let mut result = JobResult::new(&job.name);
    result.allow_failure = job.allow_failure;
    result.status = Status::Running;
    result.started_at = Some(Utc::now());

    info!(job = %job.name, runner = %factory.runner_type(), "Starting job");

    let (status, error) = match factory.create() {
        Err(e) => {
            error!(job = %job.name, error = %e, "Failed to create runner");
            (Status::Failed, Some(format!("failed to create runner: {}", e)))
        }
        Ok(runner) => {
            let outcome = runner.run_job(&job, &workdir).await;

            if let Err(e) = runner.cleanup().await {
                warn!(job = %job.name, error = %e, "Cleanup failed");
                events.warn(
                    Some(&job.name),
                    format!("cleanup failed for job {}: {}", job.name, e),
                );
            }

            match outcome {
                Ok(summary) => {
                    let status = if summary.success {
                        Status::Success
                    } else {
                        Status::Failed
                    };
                    let error = (!summary.success).then(|| {
                        if summary.errors.is_empty() {
                            "job failed".to_string()
                        } else {
                            summary.errors.join("; ")
                        }
                    });
                    result.summary = Some(summary);
                    (status, error)
                }
                Err(e) => (Status::Failed, Some(e.to_string())),
            }
        }
    };

    result.status = status;
    result.error = error;
    result.finished_at = Some(Utc::now());
    result.duration_ms = start.elapsed().as_millis() as u64;

    match result.status {
        Status::Success => info!(job = %job.name, duration_ms = result.duration_ms, "Job succeeded"),
        _ => warn!(
            job = %job.name,
            duration_ms = result.duration_ms,
            error = result.error.as_deref().unwrap_or_default(),
            "Job failed"
        ),
    }
    result
}

fn cancelled(job: &Job) -> JobResult {
    let mut result = JobResult::with_status(&job.name, Status::Cancelled, None);
    result.allow_failure = job.allow_failure;
    result
}

/// First `needs` entry that ran in this pipeline and did not succeed.
/// A failed `allow_failure` job still satisfies its dependents.
fn blocking_dependency(job: &Job, run: &PipelineRun) -> Option<String> {
    job.needs
        .iter()
        .find(|need| match run.job(need) {
            Some(dep) => match dep.status {
                Status::Success => false,
                Status::Failed => !dep.allow_failure,
                _ => true,
            },
            None => false,
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_parsing() {
        assert_eq!("needs".parse::<JobOrdering>().unwrap(), JobOrdering::Needs);
        assert_eq!("Unordered".parse::<JobOrdering>().unwrap(), JobOrdering::Unordered);
        assert!("random".parse::<JobOrdering>().is_err());
    }

    #[test]
    fn test_parallel_defaults_to_cpu_count() {
        assert_eq!(
            ExecutionMode::parallel(0),
            ExecutionMode::Parallel {
                max_parallel: num_cpus::get()
            }
        );
        assert_eq!(
            ExecutionMode::parallel(3),
            ExecutionMode::Parallel { max_parallel: 3 }
        );
    }

    #[test]
    fn test_blocking_dependency() {
        let mut run = PipelineRun::new("ci", false);
        run.record(JobResult::with_status("build", Status::Success, None));
        let mut lint = JobResult::with_status("lint", Status::Failed, None);
        lint.allow_failure = true;
        run.record(lint);
        run.record(JobResult::with_status("e2e", Status::Failed, None));

        let job = Job::new("deploy").with_needs(&["build", "lint"]);
        assert_eq!(blocking_dependency(&job, &run), None);

        let job = Job::new("deploy").with_needs(&["build", "e2e"]);
        assert_eq!(blocking_dependency(&job, &run), Some("e2e".to_string()));

        let job = Job::new("deploy").with_needs(&["unselected"]);
        assert_eq!(blocking_dependency(&job, &run), None);
    }
}
