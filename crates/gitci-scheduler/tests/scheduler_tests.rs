//! Scheduler behaviour against mock and real runners.

use async_trait::async_trait;
use gitci_core::pipeline::{EnvVars, Job, Pipeline, Step};
use gitci_core::run::{JobSummary, Status, StepResult};
use gitci_core::{Error, Result};
use gitci_runner::{Runner, RunnerConfig, RunnerType};
use gitci_scheduler::{
    DefaultRunnerFactory, ExecutionMode, JobOrdering, JobSelector, RunnerFactory, Scheduler,
    SchedulerConfig,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared observations across every runner a factory hands out.
#[derive(Default)]
struct Probe {
    running: AtomicUsize,
    max_running: AtomicUsize,
    created: AtomicUsize,
    cleaned: AtomicUsize,
    order: Mutex<Vec<String>>,
}

struct MockRunner {
    probe: Arc<Probe>,
    failing: Arc<HashSet<String>>,
    delay: Duration,
}

#[async_trait]
impl Runner for MockRunner {
    async fn run_job(&self, job: &Job, _workdir: &Path) -> Result<JobSummary> {
        let now = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_running.fetch_max(now, Ordering::SeqCst);
        self.probe.order.lock().unwrap().push(job.name.clone());

        tokio::time::sleep(self.delay).await;
        self.probe.running.fetch_sub(1, Ordering::SeqCst);

        let mut summary = JobSummary::new(&job.name, "mock", job.steps.len());
        if self.failing.contains(&job.name) {
            summary.fail(format!("Step 'run' failed: {} broke", job.name));
        } else {
            summary.completed_steps = job.steps.len();
        }
        Ok(summary)
    }

    async fn run_step(&self, step: &Step, _env: &EnvVars, _workdir: &Path) -> Result<StepResult> {
        Ok(StepResult::new(step.display_name()))
    }

    async fn cleanup(&self) -> Result<()> {
        self.probe.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn runner_type(&self) -> RunnerType {
        RunnerType::Process
    }
}

struct MockFactory {
    probe: Arc<Probe>,
    failing: Arc<HashSet<String>>,
    delay: Duration,
    broken: bool,
}

impl MockFactory {
    fn new(failing: &[&str]) -> Self {
        Self {
            probe: Arc::new(Probe::default()),
            failing: Arc::new(failing.iter().map(|s| s.to_string()).collect()),
            delay: Duration::from_millis(10),
            broken: false,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl RunnerFactory for MockFactory {
    fn create(&self) -> Result<Box<dyn Runner>> {
        if self.broken {
            return Err(Error::RunnerUnavailable {
                runner: "mock".to_string(),
                message: "daemon not reachable".to_string(),
            });
        }
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRunner {
            probe: self.probe.clone(),
            failing: self.failing.clone(),
            delay: self.delay,
        }))
    }

    fn runner_type(&self) -> RunnerType {
        RunnerType::Process
    }
}

fn job(name: &str) -> Job {
    Job::new(name).with_step(Step::run("run", "true"))
}

fn jobs(names: &[&str]) -> Vec<Job> {
    names.iter().map(|n| job(n)).collect()
}

fn scheduler(factory: Arc<MockFactory>, config: SchedulerConfig) -> Scheduler {
    Scheduler::new(factory, config)
}

#[tokio::test]
async fn test_parallel_respects_max_parallel() {
    let factory = Arc::new(MockFactory::new(&[]).with_delay(Duration::from_millis(50)));
    let config = SchedulerConfig {
        mode: ExecutionMode::parallel(2),
        ..Default::default()
    };

    let run = scheduler(factory.clone(), config)
        .run_jobs("ci", jobs(&["a", "b", "c", "d", "e"]))
        .await
        .unwrap();

    assert_eq!(run.succeeded(), 5);
    assert!(run.outcome().is_ok());
    assert!(factory.probe.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(factory.probe.created.load(Ordering::SeqCst), 5);
    assert_eq!(factory.probe.cleaned.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_parallel_runs_every_job_despite_failures() {
    let factory = Arc::new(MockFactory::new(&["b"]));
    let config = SchedulerConfig {
        mode: ExecutionMode::parallel(4),
        ..Default::default()
    };

    let run = scheduler(factory, config)
        .run_jobs("ci", jobs(&["a", "b", "c"]))
        .await
        .unwrap();

    assert_eq!(run.total(), 3);
    assert_eq!(run.failed(), 1);
    assert_eq!(run.succeeded(), 2);
    let err = run.outcome().unwrap_err();
    assert!(matches!(err, Error::PipelineFailed { failed: 1, total: 3, .. }));
    assert!(err.to_string().contains("job 'b' failed"));
}

#[tokio::test]
async fn test_sequential_failure_cancels_remaining_jobs() {
    let factory = Arc::new(MockFactory::new(&["a"]));

    let run = scheduler(factory.clone(), SchedulerConfig::default())
        .run_jobs("ci", jobs(&["a", "b", "c"]))
        .await
        .unwrap();

    assert_eq!(run.job("a").unwrap().status, Status::Failed);
    assert_eq!(run.job("b").unwrap().status, Status::Cancelled);
    assert_eq!(run.job("c").unwrap().status, Status::Cancelled);
    assert_eq!(*factory.probe.order.lock().unwrap(), vec!["a"]);
    assert!(run.outcome().is_err());
}

#[tokio::test]
async fn test_continue_on_error_runs_everything_and_passes() {
    let factory = Arc::new(MockFactory::new(&["a"]));
    let config = SchedulerConfig {
        continue_on_error: true,
        ..Default::default()
    };

    let run = scheduler(factory.clone(), config)
        .run_jobs("ci", jobs(&["a", "b"]))
        .await
        .unwrap();

    assert_eq!(run.failed(), 1);
    assert_eq!(run.succeeded(), 1);
    assert!(run.is_success());
    assert_eq!(*factory.probe.order.lock().unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_allow_failure_avoids_abort_but_still_counts() {
    let factory = Arc::new(MockFactory::new(&["a"]));
    let mut flaky = job("a");
    flaky.allow_failure = true;

    let run = scheduler(factory, SchedulerConfig::default())
        .run_jobs("ci", vec![flaky, job("b")])
        .await
        .unwrap();

    assert_eq!(run.job("b").unwrap().status, Status::Success);
    assert!(run.job("a").unwrap().allow_failure);
    assert!(run.outcome().is_err());
}

#[tokio::test]
async fn test_runner_creation_error_is_a_job_failure() {
    let mut factory = MockFactory::new(&[]);
    factory.broken = true;

    let run = scheduler(Arc::new(factory), SchedulerConfig::default())
        .run_jobs("ci", jobs(&["a"]))
        .await
        .unwrap();

    let result = run.job("a").unwrap();
    assert_eq!(result.status, Status::Failed);
    assert!(result.error.as_deref().unwrap().contains("failed to create runner"));
}

#[tokio::test]
async fn test_needs_ordering_runs_layers_in_order() {
    let factory = Arc::new(MockFactory::new(&[]));
    let config = SchedulerConfig {
        ordering: JobOrdering::Needs,
        mode: ExecutionMode::parallel(4),
        ..Default::default()
    };
    let jobs = vec![
        job("deploy").with_needs(&["test"]),
        job("test").with_needs(&["build"]),
        job("build"),
    ];

    let run = scheduler(factory.clone(), config)
        .run_jobs("ci", jobs)
        .await
        .unwrap();

    assert_eq!(run.succeeded(), 3);
    assert_eq!(
        *factory.probe.order.lock().unwrap(),
        vec!["build", "test", "deploy"]
    );
}

#[tokio::test]
async fn test_needs_ordering_skips_dependents_of_failures() {
    let factory = Arc::new(MockFactory::new(&["build"]));
    let config = SchedulerConfig {
        ordering: JobOrdering::Needs,
        continue_on_error: true,
        ..Default::default()
    };
    let jobs = vec![
        job("build"),
        job("lint"),
        job("test").with_needs(&["build"]),
        job("deploy").with_needs(&["test"]),
    ];

    let run = scheduler(factory, config).run_jobs("ci", jobs).await.unwrap();

    assert_eq!(run.job("build").unwrap().status, Status::Failed);
    assert_eq!(run.job("lint").unwrap().status, Status::Success);
    assert_eq!(run.job("test").unwrap().status, Status::Skipped);
    assert_eq!(run.job("deploy").unwrap().status, Status::Skipped);
}

#[tokio::test]
async fn test_needs_ordering_cancels_later_layers_on_abort() {
    let factory = Arc::new(MockFactory::new(&["build"]));
    let config = SchedulerConfig {
        ordering: JobOrdering::Needs,
        ..Default::default()
    };
    let jobs = vec![job("build"), job("test").with_needs(&["build"])];

    let run = scheduler(factory, config).run_jobs("ci", jobs).await.unwrap();
    assert_eq!(run.job("test").unwrap().status, Status::Cancelled);
}

#[tokio::test]
async fn test_selector_errors_propagate() {
    let factory = Arc::new(MockFactory::new(&[]));
    let pipeline = Pipeline::new("ci").with_job(job("build"));

    let err = scheduler(factory, SchedulerConfig::default())
        .run(&pipeline, &JobSelector::new().job("deploy"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoJobsSelected(_)));
}

#[tokio::test]
async fn test_shell_runner_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let runner_config = RunnerConfig {
        default_shell: Some("sh".to_string()),
        ..Default::default()
    };
    let factory = Arc::new(DefaultRunnerFactory::new(RunnerType::Process, runner_config));
    let config = SchedulerConfig {
        workdir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let pipeline = Pipeline::new("ci")
        .with_job(Job::new("write").with_step(Step::run("touch", "touch out.txt")))
        .with_job(Job::new("check").with_step(Step::run("check", "test -f out.txt")));

    let run = Scheduler::new(factory, config)
        .run(&pipeline, &JobSelector::new())
        .await
        .unwrap();

    assert!(run.outcome().is_ok());
    assert_eq!(run.succeeded(), 2);
    let summary = run.job("check").unwrap().summary.as_ref().unwrap();
    assert_eq!(summary.completed_steps, 1);
}
