//! Container-based job execution using Docker.

use crate::env::{container_job_env, runner_markers};
use crate::images::resolve_image;
use crate::runner::{PullPolicy, Runner, RunnerConfig, RunnerType, resolve_workdir};
use crate::script::job_script;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures::StreamExt;
use gitci_core::events::{Event, JobCompletedPayload, JobStartedPayload, StepOutputPayload};
use gitci_core::pipeline::{EnvVars, Job, Step};
use gitci_core::run::{JobSummary, Status, StepResult};
use gitci_core::{Error, OutputStream, Result};
use std::collections::VecDeque;
use std::path::Path;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Mount point of the job workspace inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Memory cap for job containers, swap included.
const MEMORY_LIMIT: i64 = 2 * 1024 * 1024 * 1024;
const CPU_SHARES: i64 = 1024;
/// Log lines replayed when a container fails.
const FAILURE_TAIL_LINES: usize = 20;

/// Container runner executing each job as one script in a fresh container.
pub struct ContainerRunner {
    docker: Option<Docker>,
    config: RunnerConfig,
    containers: Mutex<Vec<String>>,
}

impl ContainerRunner {
    /// Create a new container runner.
    ///
    /// Dry runs never talk to the daemon, so no client is created for them.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let docker = if config.dry_run {
            None
        } else {
            Some(
                Docker::connect_with_local_defaults().map_err(|e| Error::RunnerUnavailable {
                    runner: RunnerType::Container.to_string(),
                    message: format!("Failed to connect to Docker: {}", e),
                })?,
            )
        };

        Ok(Self {
            docker,
            config,
            containers: Mutex::new(Vec::new()),
        })
    }

    /// Create with an existing Docker client.
    pub fn with_docker(docker: Docker, config: RunnerConfig) -> Self {
        Self {
            docker: Some(docker),
            config,
            containers: Mutex::new(Vec::new()),
        }
    }

    fn docker(&self) -> Result<&Docker> {
        self.docker.as_ref().ok_or_else(|| Error::RunnerUnavailable {
            runner: RunnerType::Container.to_string(),
            message: "no Docker client".to_string(),
        })
    }

    /// IDs of containers created and not yet cleaned up.
    pub async fn tracked_containers(&self) -> Vec<String> {
        self.containers.lock().await.clone()
    }

    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<()> {
        let present = docker.inspect_image(image).await.is_ok();

        match self.config.pull_policy {
            PullPolicy::IfNotPresent if present => {
                debug!(image = %image, "Image present locally");
                return Ok(());
            }
            PullPolicy::Never if present => return Ok(()),
            PullPolicy::Never => {
                return Err(Error::Docker(format!(
                    "image {} is not present locally and pull policy is never",
                    image
                )));
            }
            _ => {}
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update =
                update.map_err(|e| Error::Docker(format!("Failed to pull image {}: {}", image, e)))?;
            if self.config.verbose {
                if let Some(status) = update.status {
                    debug!(image = %image, progress = ?update.progress, "{}", status);
                }
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        docker: &Docker,
        job: &Job,
        image: &str,
        workdir: &Path,
        env: &EnvVars,
        script: &str,
    ) -> Result<String> {
        if self.config.verbose {
            debug!(job = %job.name, "Generated script:\n{}", script);
        }

        let mut mounts = vec![Mount {
            target: Some(WORKSPACE_MOUNT.to_string()),
            source: Some(workdir.display().to_string()),
            typ: Some(MountTypeEnum::BIND),
            ..Default::default()
        }];
        if let Some(container) = &job.container {
            mounts.extend(container.volumes.iter().map(String::as_str).filter_map(volume_mount));
        }

        let container_config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]),
            env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            tty: Some(false),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                auto_remove: Some(false),
                memory: Some(MEMORY_LIMIT),
                memory_swap: Some(MEMORY_LIMIT),
                cpu_shares: Some(CPU_SHARES),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = container_name(&job.name, chrono::Utc::now().timestamp());
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| Error::Docker(format!("Failed to create container: {}", e)))?;

        debug!(container = %short_id(&response.id), name = %name, "Container created");
        Ok(response.id)
    }

    /// Follow the container logs until it stops. Returns the last lines seen.
    async fn stream_logs(&self, docker: &Docker, id: &str, job: &Job) -> VecDeque<String> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut tail = VecDeque::with_capacity(FAILURE_TAIL_LINES);
        let mut splitter = LogSplitter::new(&job.name, self.config.events.clone());
        let mut logs = docker.logs(id, Some(options));

        while let Some(chunk) = logs.next().await {
            let lines = match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    splitter.push(OutputStream::Stdout, &message)
                }
                Ok(LogOutput::StdErr { message }) => splitter.push(OutputStream::Stderr, &message),
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Error reading container logs");
                    break;
                }
            };
            for line in lines {
                if tail.len() == FAILURE_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        for line in splitter.flush() {
            if tail.len() == FAILURE_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    }

    async fn wait(&self, docker: &Docker, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        match docker.wait_container(id, Some(options)).next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Docker(format!("Container wait failed: {}", e))),
            None => Err(Error::Docker("Container wait returned no result".to_string())),
        }
    }

    async fn execute(
        &self,
        job: &Job,
        image: &str,
        workdir: &Path,
        env: &EnvVars,
        script: &str,
        summary: &mut JobSummary,
    ) -> Result<()> {
        let docker = self.docker()?;
        docker.ping().await.map_err(|e| Error::RunnerUnavailable {
            runner: RunnerType::Container.to_string(),
            message: format!("Docker daemon not reachable: {}", e),
        })?;

        self.ensure_image(docker, image).await?;

        let id = self
            .create_container(docker, job, image, workdir, env, script)
            .await?;
        self.containers.lock().await.push(id.clone());

        docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Docker(format!("Failed to start container: {}", e)))?;
        info!(job = %job.name, container = %short_id(&id), image = %image, "Container started");

        let run = async {
            let tail = self.stream_logs(docker, &id, job).await;
            let code = self.wait(docker, &id).await?;
            Ok::<_, Error>((code, tail))
        };

        let (exit_code, tail) = match self.config.job_timeout(job) {
            Some(limit) => match timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    let minutes = limit.as_secs() / 60;
                    warn!(job = %job.name, minutes, "Job timeout exceeded, killing container");
                    let _ = docker.kill_container::<String>(&id, None).await;
                    summary.fail(format!("Job timeout exceeded ({} minutes)", minutes));
                    return Ok(());
                }
            },
            None => run.await?,
        };

        if exit_code != 0 {
            let failure = Error::ContainerExited { exit_code };
            error!(job = %job.name, exit_code, "Container exited with failure");
            if !tail.is_empty() {
                let lines: Vec<String> = tail.into_iter().collect();
                self.config.events.warn(
                    Some(&job.name),
                    format!(
                        "Last {} lines of output:\n{}",
                        lines.len(),
                        lines.join("\n")
                    ),
                );
            }
            summary.fail(failure.to_string());
            return Ok(());
        }

        summary.completed_steps = job.steps.len();
        Ok(())
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    async fn run_job(&self, job: &Job, workdir: &Path) -> Result<JobSummary> {
        let start = std::time::Instant::now();
        let workdir = resolve_workdir(workdir).await?;
        let events = &self.config.events;

        let image = resolve_image(job, &self.config.default_image);
        let markers = runner_markers(RunnerType::Container, job, WORKSPACE_MOUNT);
        let env = container_job_env(&self.config, &markers, job);
        let script = job_script(job, self.config.verbose, |step| {
            self.config
                .conditions
                .should_run(step.condition.as_deref(), &env)
        });

        info!(job = %job.name, image = %image, dry_run = self.config.dry_run, "Running job in container");
        events.emit(Event::JobStarted(JobStartedPayload {
            job: job.name.clone(),
            runner: RunnerType::Container.to_string(),
            total_steps: job.steps.len(),
            started_at: chrono::Utc::now(),
        }));

        let mut summary =
            JobSummary::new(&job.name, RunnerType::Container.as_str(), job.steps.len());

        let outcome = if self.config.dry_run {
            events.dry_run(&job.name, None, dry_run_plan(job, &image, &workdir, &script));
            summary.completed_steps = job.steps.len();
            Ok(())
        } else {
            self.execute(job, &image, &workdir, &env, &script, &mut summary)
                .await
        };
        if let Err(e) = &outcome {
            error!(job = %job.name, error = %e, "Container job could not run");
            summary.fail(e.to_string());
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        events.emit(Event::JobCompleted(JobCompletedPayload {
            job: job.name.clone(),
            status: if summary.success {
                Status::Success
            } else {
                Status::Failed
            },
            summary: summary.clone(),
        }));
        outcome.map(|()| summary)
    }

    async fn run_step(&self, step: &Step, env: &EnvVars, workdir: &Path) -> Result<StepResult> {
        let name = env
            .get("JOB_NAME")
            .cloned()
            .unwrap_or_else(|| step.display_name());
        let mut job = Job::new(name).with_step(step.clone());
        job.env = env.clone();

        let mut result = StepResult::new(step.display_name());
        result.start();
        let summary = self.run_job(&job, workdir).await?.into_result();
        match summary {
            Ok(_) => {
                result.exit_code = Some(0);
                result.finish(Status::Success);
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let containers: Vec<String> = std::mem::take(&mut *self.containers.lock().await);
        if containers.is_empty() {
            return Ok(());
        }
        let docker = self.docker()?;

        let mut failures = Vec::new();
        for id in containers {
            let short = short_id(&id);

            let _ = docker
                .stop_container(&id, Some(StopContainerOptions { t: 10 }))
                .await;

            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            match docker.remove_container(&id, Some(options)).await {
                Ok(()) => info!(container = %short, "Removed container"),
                Err(e) => {
                    warn!(container = %short, error = %e, "Failed to remove container");
                    failures.push(format!("Failed to remove {}: {}", short, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup { failures })
        }
    }

    fn runner_type(&self) -> RunnerType {
        RunnerType::Container
    }
}

/// Splits raw log frames into whole lines and forwards them as events.
///
/// Lines are attributed to the step whose `[n/total] name` marker was seen
/// last.
struct LogSplitter {
    job: String,
    step: String,
    events: gitci_core::EventSink,
    pending: [Vec<u8>; 2],
    line_numbers: [u32; 2],
}

impl LogSplitter {
    fn new(job: &str, events: gitci_core::EventSink) -> Self {
        Self {
            job: job.to_string(),
            step: "setup".to_string(),
            events,
            pending: [Vec::new(), Vec::new()],
            line_numbers: [0, 0],
        }
    }

    fn slot(stream: OutputStream) -> usize {
        match stream {
            OutputStream::Stdout => 0,
            OutputStream::Stderr => 1,
        }
    }

    fn push(&mut self, stream: OutputStream, chunk: &[u8]) -> Vec<String> {
        let slot = Self::slot(stream);
        self.pending[slot].extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending[slot].iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending[slot].drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            self.emit(stream, &text);
            lines.push(text);
        }
        lines
    }

    fn flush(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let slot = Self::slot(stream);
            if self.pending[slot].is_empty() {
                continue;
            }
            let raw = std::mem::take(&mut self.pending[slot]);
            let text = String::from_utf8_lossy(&raw).to_string();
            self.emit(stream, &text);
            lines.push(text);
        }
        lines
    }

    fn emit(&mut self, stream: OutputStream, content: &str) {
        if let Some(step) = step_marker(content) {
            self.step = step.to_string();
        }
        let slot = Self::slot(stream);
        self.line_numbers[slot] += 1;

        self.events.emit(Event::StepOutput(StepOutputPayload {
            job: self.job.clone(),
            step: self.step.clone(),
            stream,
            line: content.to_string(),
            line_number: self.line_numbers[slot],
        }));
    }
}

/// Step name from a `[n/total] name` marker line.
fn step_marker(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('[')?;
    let (counter, name) = rest.split_once("] ")?;
    let (n, total) = counter.split_once('/')?;
    if n.parse::<usize>().is_ok() && total.parse::<usize>().is_ok() {
        Some(name)
    } else {
        None
    }
}

/// Bind mount from a `src:dst[:ro]` specification.
fn volume_mount(spec: &str) -> Option<Mount> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 {
        warn!(volume = %spec, "Ignoring malformed volume");
        return None;
    }
    Some(Mount {
        source: Some(parts[0].to_string()),
        target: Some(parts[1].to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(parts.get(2) == Some(&"ro")),
        ..Default::default()
    })
}

/// Docker accepts `[a-zA-Z0-9][a-zA-Z0-9_.-]+`; the `git-ci-` prefix covers
/// the first character.
fn container_name(job: &str, unix_secs: i64) -> String {
    let job: String = job
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '-',
        })
        .collect();
    format!("git-ci-{}-{}", job, unix_secs)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn dry_run_plan(job: &Job, image: &str, workdir: &Path, script: &str) -> String {
    let mut plan = format!("image: {}\nmount: {}:{}", image, workdir.display(), WORKSPACE_MOUNT);
    if let Some(container) = &job.container {
        for volume in &container.volumes {
            plan.push_str(&format!("\nmount: {}", volume));
        }
    }
    plan.push_str("\nscript:\n");
    plan.push_str(script);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitci_core::EventSink;
    use gitci_core::pipeline::ContainerSpec;

    fn dry_runner(events: EventSink) -> ContainerRunner {
        ContainerRunner::new(RunnerConfig {
            dry_run: true,
            events,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("Build And Test", 1700000000), "git-ci-build-and-test-1700000000");
        assert_eq!(container_name("build (linux)", 1), "git-ci-build--linux--1");
        assert_eq!(container_name("tëst/x", 1), "git-ci-t-st-x-1");
    }

    #[test]
    fn test_volume_mount_parsing() {
        let mount = volume_mount("/cache:/root/.cache:ro").unwrap();
        assert_eq!(mount.source.as_deref(), Some("/cache"));
        assert_eq!(mount.target.as_deref(), Some("/root/.cache"));
        assert_eq!(mount.read_only, Some(true));

        let mount = volume_mount("/data:/data").unwrap();
        assert_eq!(mount.read_only, Some(false));

        assert!(volume_mount("/only-source").is_none());
    }

    #[test]
    fn test_step_marker() {
        assert_eq!(step_marker("[2/5] unit tests"), Some("unit tests"));
        assert_eq!(step_marker("[a/b] nope"), None);
        assert_eq!(step_marker("plain output"), None);
    }

    #[test]
    fn test_log_splitter_joins_partial_frames() {
        let (events, mut rx) = EventSink::channel();
        let mut splitter = LogSplitter::new("build", events);

        assert!(splitter.push(OutputStream::Stdout, b"[1/1] com").is_empty());
        let lines = splitter.push(OutputStream::Stdout, b"pile\nhello\npart");
        assert_eq!(lines, vec!["[1/1] compile", "hello"]);
        assert_eq!(splitter.flush(), vec!["part"]);

        let steps: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::StepOutput(out) => Some(out.step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec!["compile", "compile", "compile"]);
    }

    #[tokio::test]
    async fn test_dry_run_needs_no_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let runner = dry_runner(events);

        let mut job = Job::new("build")
            .with_step(Step::run("compile", "make"))
            .with_step(Step::run("test", "make test"));
        job.runs_on = Some("ubuntu-22.04".to_string());
        job.container = Some(ContainerSpec {
            image: String::new(),
            volumes: vec!["/cache:/cache:ro".to_string()],
            ..Default::default()
        });

        let summary = runner.run_job(&job, dir.path()).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.completed_steps, 2);
        assert!(runner.tracked_containers().await.is_empty());

        let plan = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                Event::DryRun(d) => Some(d.plan),
                _ => None,
            })
            .unwrap();
        assert!(plan.starts_with("image: ubuntu:22.04\n"));
        assert!(plan.contains(":/workspace"));
        assert!(plan.contains("mount: /cache:/cache:ro"));
        assert!(plan.contains("echo '[1/2] compile'"));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_still_completes_job() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let runner = ContainerRunner {
            docker: None,
            config: RunnerConfig {
                events,
                ..Default::default()
            },
            containers: Mutex::new(Vec::new()),
        };

        let job = Job::new("build").with_step(Step::run("compile", "make"));
        let err = runner.run_job(&job, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::RunnerUnavailable { .. }));

        let completed = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                Event::JobCompleted(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(completed.status, Status::Failed);
        assert!(!completed.summary.success);
        assert!(completed.summary.errors[0].contains("no Docker client"));
    }

    #[tokio::test]
    async fn test_cleanup_without_containers_is_noop() {
        let runner = dry_runner(EventSink::disabled());
        assert!(runner.cleanup().await.is_ok());
        assert_eq!(runner.runner_type(), RunnerType::Container);
    }
}
