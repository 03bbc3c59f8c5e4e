//! Shell-based job execution on the host.

use crate::actions::KnownAction;
use crate::env::{git_markers, process_job_env, runner_markers, step_env};
use crate::retry::{FailureKind, RetryMachine};
use crate::runner::{Runner, RunnerConfig, RunnerType, resolve_workdir};
use async_trait::async_trait;
use gitci_core::events::{
    Event, JobCompletedPayload, JobStartedPayload, StepCompletedPayload, StepOutputPayload,
    StepRetryingPayload, StepStartedPayload,
};
use gitci_core::pipeline::{EnvVars, Job, Step, StepAction};
use gitci_core::run::{JobSummary, Status, StepResult};
use gitci_core::{Error, EventSink, OutputStream, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, error, info, warn};

/// Shells probed, in order, when nothing names one.
const SHELL_PRIORITY: &[&str] = &["bash", "sh"];

/// Shell runner for executing steps as host subprocesses.
pub struct ShellRunner {
    config: RunnerConfig,
}

/// Names used to tag output events of one step.
#[derive(Debug, Clone)]
struct StepContext {
    job: String,
    step: String,
    events: EventSink,
}

/// Captured result of one subprocess.
#[derive(Debug, Clone, Default)]
struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn failure_message(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "command exited with non-zero status".to_string())
    }
}

/// Absolute job deadline and the limit it came from.
#[derive(Debug, Clone, Copy)]
struct JobDeadline {
    at: Instant,
    minutes: u64,
}

/// A finished step and, when it failed, why.
struct StepExecution {
    result: StepResult,
    error: Option<Error>,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Step shell, else job, pipeline and configured defaults, else the
    /// first of `bash` and `sh` found on `PATH`.
    fn resolve_shell(&self, step: &Step, job_shell: Option<&str>) -> String {
        step.shell
            .as_deref()
            .or(job_shell)
            .or(self.config.pipeline_shell.as_deref())
            .or(self.config.default_shell.as_deref())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(detect_shell)
    }

    async fn execute_command(
        &self,
        ctx: &StepContext,
        program: &str,
        args: &[String],
        env: &EnvVars,
        cwd: &Path,
        limit: Option<Duration>,
    ) -> Result<Option<CommandOutput>> {
        let start = std::time::Instant::now();

        debug!(program = %program, cwd = %cwd.display(), "Spawning process");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not captured".to_string()))?;

        let stdout_handle = spawn_line_reader(stdout, OutputStream::Stdout, ctx.clone());
        let stderr_handle = spawn_line_reader(stderr, OutputStream::Stderr, ctx.clone());
        let stdout_abort = stdout_handle.abort_handle();
        let stderr_abort = stderr_handle.abort_handle();

        let wait_result = match limit {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(step = %ctx.step, limit_secs = limit.as_secs(), "Command timed out, killing process");
                    let _ = child.kill().await;
                    stdout_handle.abort();
                    stderr_handle.abort();
                    return Ok(None);
                }
            },
            None => child.wait().await,
        };

        // Backgrounded children can hold the pipes open after the shell exits.
        let readers = async {
            let stdout = stdout_handle.await.unwrap_or_default();
            let stderr = stderr_handle.await.unwrap_or_default();
            (stdout, stderr)
        };
        let (stdout, stderr) = match limit {
            Some(limit) => match timeout(limit.saturating_sub(start.elapsed()), readers).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(step = %ctx.step, limit_secs = limit.as_secs(), "Output still open at timeout, abandoning readers");
                    stdout_abort.abort();
                    stderr_abort.abort();
                    return Ok(None);
                }
            },
            None => readers.await,
        };

        let status = wait_result.map_err(|e| Error::Spawn {
            program: program.to_string(),
            source: e,
        })?;

        let exit_code = status.code().unwrap_or(-1);
        debug!(
            exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command completed"
        );

        Ok(Some(CommandOutput {
            exit_code,
            stdout,
            stderr,
        }))
    }

    /// Run one attempt of a shell step, translating exits and deadlines.
    async fn attempt(
        &self,
        ctx: &StepContext,
        step: &Step,
        program: &str,
        args: &[String],
        env: &EnvVars,
        cwd: &Path,
        deadline: Option<JobDeadline>,
        result: &mut StepResult,
    ) -> Result<()> {
        let step_limit =
            (step.timeout_minutes > 0).then(|| Duration::from_secs(step.timeout_minutes as u64 * 60));
        let job_limit = deadline.map(|d| d.at.saturating_duration_since(Instant::now()));

        let (limit, timeout_error) = match (step_limit, job_limit) {
            (_, Some(remaining)) if remaining.is_zero() => {
                return Err(job_timeout(deadline));
            }
            (Some(step_limit), Some(remaining)) if remaining < step_limit => {
                (Some(remaining), job_timeout(deadline))
            }
            (Some(step_limit), _) => (
                Some(step_limit),
                Error::StepTimeout {
                    minutes: step.timeout_minutes as u64,
                },
            ),
            (None, Some(remaining)) => (Some(remaining), job_timeout(deadline)),
            (None, None) => (None, Error::Internal("unbounded step timed out".to_string())),
        };

        match self
            .execute_command(ctx, program, args, env, cwd, limit)
            .await?
        {
            None => Err(timeout_error),
            Some(output) => {
                result.exit_code = Some(output.exit_code);
                result.stdout = output.stdout.clone();
                result.stderr = output.stderr.clone();
                if output.exit_code == 0 {
                    Ok(())
                } else {
                    Err(Error::StepFailed {
                        exit_code: output.exit_code,
                        message: output.failure_message(),
                    })
                }
            }
        }
    }

    async fn run_shell_step(
        &self,
        ctx: &StepContext,
        step: &Step,
        command: &str,
        job_shell: Option<&str>,
        env: &EnvVars,
        cwd: &Path,
        deadline: Option<JobDeadline>,
        result: &mut StepResult,
    ) -> Result<()> {
        let shell = self.resolve_shell(step, job_shell);
        let (program, args) = shell_command(&shell, command, self.config.verbose);

        if self.config.dry_run {
            let mut plan = format!("{} {}", program, args[..args.len() - 1].join(" "));
            plan.push_str(&format!("\n  working directory: {}", cwd.display()));
            for (key, value) in &step.env {
                plan.push_str(&format!("\n  env: {}={}", key, value));
            }
            plan.push_str(&format!("\n  command: {}", command));
            ctx.events.dry_run(&ctx.job, Some(&ctx.step), plan);
            return Ok(());
        }

        info!(job = %ctx.job, step = %ctx.step, shell = %shell, "Executing step");

        let mut machine = RetryMachine::new(step.retry.as_ref());
        machine.begin();

        let outcome = loop {
            match self
                .attempt(ctx, step, &program, &args, env, cwd, deadline, result)
                .await
            {
                Ok(()) => {
                    machine.succeed();
                    break Ok(());
                }
                Err(e) => match machine.fail(FailureKind::of(&e)) {
                    Some(delay) => {
                        let next = machine.attempts();
                        warn!(
                            step = %ctx.step,
                            attempt = next - 1,
                            error = %e,
                            "Step attempt failed, will retry"
                        );
                        ctx.events.emit(Event::StepRetrying(StepRetryingPayload {
                            job: ctx.job.clone(),
                            step: ctx.step.clone(),
                            attempt: next,
                            max_attempts: machine.max_attempts(),
                            delay_ms: delay.as_millis() as u64,
                            last_error: e.to_string(),
                        }));
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(e),
                },
            }
        };

        result.retries = machine.retries();

        match outcome {
            Ok(()) => Ok(()),
            Err(e @ Error::JobTimeout { .. }) => Err(e),
            Err(e) if machine.max_attempts() > 1 => {
                error!(step = %ctx.step, attempts = machine.attempts(), error = %e, "Step failed after all retries");
                Err(Error::RetriesExhausted {
                    attempts: machine.attempts(),
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_action(
        &self,
        ctx: &StepContext,
        reference: &str,
        with: &EnvVars,
        env: &EnvVars,
        cwd: &Path,
        result: &mut StepResult,
    ) -> Result<()> {
        let action = KnownAction::resolve(reference, with);

        if self.config.dry_run {
            ctx.events.dry_run(&ctx.job, Some(&ctx.step), action.describe());
            return Ok(());
        }

        match action {
            KnownAction::Checkout => {
                let probe = Command::new("git")
                    .args(["rev-parse", "--git-dir"])
                    .current_dir(cwd)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if !probe.map(|s| s.success()).unwrap_or(false) {
                    info!(cwd = %cwd.display(), "Not in a git repository, skipping checkout");
                    return Ok(());
                }

                let args = ["fetch", "--all", "--tags"].map(String::from);
                let output = self
                    .execute_command(ctx, "git", &args, env, cwd, None)
                    .await?
                    .unwrap_or_default();
                result.exit_code = Some(output.exit_code);
                if output.exit_code != 0 {
                    return Err(Error::StepFailed {
                        exit_code: output.exit_code,
                        message: format!("git fetch failed: {}", output.failure_message()),
                    });
                }
                info!("Repository updated");
                Ok(())
            }
            KnownAction::Setup { tool, version } => {
                let (program, args) = KnownAction::version_probe(&tool);
                let probe = Command::new(&program)
                    .args(&args)
                    .current_dir(cwd)
                    .env_clear()
                    .envs(env)
                    .output()
                    .await;
                match probe {
                    Ok(output) if output.status.success() => {
                        let installed = String::from_utf8_lossy(&output.stdout).trim().to_string();
                        info!(tool = %tool, requested = %version, installed = %installed, "Toolchain available");
                        result.stdout = installed;
                    }
                    _ => {
                        warn!(tool = %tool, "Toolchain not installed");
                        ctx.events.warn(
                            Some(&ctx.job),
                            format!("{} {} is not installed. Please install it manually", tool, version),
                        );
                    }
                }
                Ok(())
            }
            KnownAction::Unsupported { action, version } => {
                warn!(action = %action, version = %version, "Unsupported action, skipping");
                ctx.events.warn(
                    Some(&ctx.job),
                    format!("Unsupported action: {}@{} (skipping)", action, version),
                );
                Ok(())
            }
        }
    }

    async fn execute_step(
        &self,
        job: &str,
        job_shell: Option<&str>,
        step: &Step,
        env: &EnvVars,
        workdir: &Path,
        deadline: Option<JobDeadline>,
    ) -> StepExecution {
        let ctx = StepContext {
            job: job.to_string(),
            step: step.display_name(),
            events: self.config.events.clone(),
        };
        let mut result = StepResult::new(&ctx.step);
        result.start();

        let cwd = self.step_workdir(step, workdir);
        let outcome = match &step.action {
            StepAction::Uses { reference, with } => {
                self.run_action(&ctx, reference, with, env, &cwd, &mut result)
                    .await
            }
            action => match action.command() {
                Some(command) if !command.trim().is_empty() => {
                    self.run_shell_step(
                        &ctx,
                        step,
                        &command,
                        job_shell,
                        env,
                        &cwd,
                        deadline,
                        &mut result,
                    )
                    .await
                }
                _ => Ok(()),
            },
        };

        match outcome {
            Ok(()) => {
                result.finish(Status::Success);
                StepExecution {
                    result,
                    error: None,
                }
            }
            Err(e) => {
                result.error = Some(e.to_string());
                result.finish(Status::Failed);
                StepExecution {
                    result,
                    error: Some(e),
                }
            }
        }
    }

    fn step_workdir(&self, step: &Step, workdir: &Path) -> PathBuf {
        match step
            .working_directory
            .as_deref()
            .or(self.config.pipeline_working_directory.as_deref())
        {
            Some(dir) if !dir.is_empty() => workdir.join(dir),
            _ => workdir.to_path_buf(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn run_job(&self, job: &Job, workdir: &Path) -> Result<JobSummary> {
        let start = std::time::Instant::now();
        let workdir = resolve_workdir(workdir).await?;
        let events = &self.config.events;

        info!(job = %job.name, workdir = %workdir.display(), dry_run = self.config.dry_run, "Running job");
        events.emit(Event::JobStarted(JobStartedPayload {
            job: job.name.clone(),
            runner: RunnerType::Process.to_string(),
            total_steps: job.steps.len(),
            started_at: chrono::Utc::now(),
        }));

        let mut markers = runner_markers(
            RunnerType::Process,
            job,
            &workdir.display().to_string(),
        );
        if !self.config.dry_run {
            markers.extend(git_markers(&workdir).await);
        }
        let job_env = process_job_env(&self.config, &markers, job);

        let deadline = self.config.job_timeout(job).map(|limit| JobDeadline {
            at: Instant::now() + limit,
            minutes: limit.as_secs() / 60,
        });

        let mut summary = JobSummary::new(&job.name, RunnerType::Process.as_str(), job.steps.len());

        for (i, step) in job.steps.iter().enumerate() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline.at {
                    warn!(job = %job.name, minutes = deadline.minutes, "Job timeout exceeded");
                    summary.fail(format!("Job timeout exceeded ({} minutes)", deadline.minutes));
                    break;
                }
            }

            let name = step.display_name();
            events.emit(Event::StepStarted(StepStartedPayload {
                job: job.name.clone(),
                step: name.clone(),
                index: i + 1,
                total: job.steps.len(),
            }));

            if !self
                .config
                .conditions
                .should_run(step.condition.as_deref(), &job_env)
            {
                debug!(job = %job.name, step = %name, "Condition not met, skipping step");
                let result = StepResult::skipped(&name);
                emit_step_completed(events, &job.name, &result);
                summary.record(result);
                continue;
            }

            let env = step_env(&job_env, step);
            let execution = self
                .execute_step(&job.name, job.shell.as_deref(), step, &env, &workdir, deadline)
                .await;
            emit_step_completed(events, &job.name, &execution.result);

            match execution.error {
                None => summary.record(execution.result),
                Some(e) if step.continue_on_error => {
                    warn!(job = %job.name, step = %name, error = %e, "Step failed but continuing");
                    events.warn(
                        Some(&job.name),
                        format!("Step '{}' failed but continuing: {}", name, e),
                    );
                    summary.record(execution.result);
                }
                Some(e) => {
                    error!(job = %job.name, step = %name, error = %e, "Step failed");
                    summary.fail(format!("Step '{}' failed: {}", name, e));
                    summary.record(execution.result);
                    break;
                }
            }
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

        Ok(summary)
    }

    async fn run_step(&self, step: &Step, env: &EnvVars, workdir: &Path) -> Result<StepResult> {
        let job = env.get("JOB_NAME").cloned().unwrap_or_default();
        let execution = self
            .execute_step(&job, None, step, env, workdir, None)
            .await;
        match execution.error {
            Some(e) => Err(e),
            None => Ok(execution.result),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        // Children are reaped before run_job returns.
        Ok(())
    }

    fn runner_type(&self) -> RunnerType {
        RunnerType::Process
    }
}

fn job_timeout(deadline: Option<JobDeadline>) -> Error {
    Error::JobTimeout {
        minutes: deadline.map(|d| d.minutes).unwrap_or_default(),
    }
}

fn emit_step_completed(events: &EventSink, job: &str, result: &StepResult) {
    events.emit(Event::StepCompleted(StepCompletedPayload {
        job: job.to_string(),
        result: result.clone(),
    }));
}

/// First shell of the priority list found on `PATH`.
pub fn detect_shell() -> String {
    SHELL_PRIORITY
        .iter()
        .find(|shell| which::which(shell).is_ok())
        .unwrap_or(&"sh")
        .to_string()
}

/// Program and arguments running `script` under `shell` in strict mode.
pub fn shell_command(shell: &str, script: &str, verbose: bool) -> (String, Vec<String>) {
    let name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);

    let mut args: Vec<String> = match name {
        "bash" => vec!["-eo".into(), "pipefail".into()],
        "sh" | "dash" | "zsh" => vec!["-e".into()],
        _ => Vec::new(),
    };
    if verbose && matches!(name, "bash" | "sh" | "dash" | "zsh") {
        args.push("-x".into());
    }

    let (program, flag) = match name {
        "pwsh" | "powershell" => ("pwsh".to_string(), "-Command"),
        "python" | "python3" => ("python3".to_string(), "-c"),
        "node" => ("node".to_string(), "-e"),
        _ => (shell.to_string(), "-c"),
    };
    args.push(flag.to_string());
    args.push(script.to_string());
    (program, args)
}

fn spawn_line_reader<R>(reader: R, stream: OutputStream, ctx: StepContext) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut captured = String::new();
        let mut buf = Vec::new();
        let mut line_number = 0u32;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    line_number += 1;
                    let text = String::from_utf8_lossy(&buf);
                    let content = text.trim_end_matches(['\n', '\r']).to_string();
                    captured.push_str(&content);
                    captured.push('\n');

                    ctx.events.emit(Event::StepOutput(StepOutputPayload {
                        job: ctx.job.clone(),
                        step: ctx.step.clone(),
                        stream,
                        line: content,
                        line_number,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "Error reading process output");
                    break;
                }
            }
        }

        captured
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitci_core::pipeline::RetryPolicy;

    fn runner() -> ShellRunner {
        ShellRunner::new(RunnerConfig {
            default_shell: Some("sh".to_string()),
            ..Default::default()
        })
    }

    fn job(name: &str, steps: Vec<Step>) -> Job {
        let mut job = Job::new(name);
        job.steps = steps;
        job
    }

    #[test]
    fn test_shell_command_flags() {
        let (program, args) = shell_command("bash", "make", false);
        assert_eq!(program, "bash");
        assert_eq!(args, vec!["-eo", "pipefail", "-c", "make"]);

        let (_, args) = shell_command("sh", "make", true);
        assert_eq!(args, vec!["-e", "-x", "-c", "make"]);

        let (program, args) = shell_command("python", "print(1)", false);
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["-c", "print(1)"]);

        let (program, args) = shell_command("pwsh", "Write-Host hi", false);
        assert_eq!(program, "pwsh");
        assert_eq!(args, vec!["-Command", "Write-Host hi"]);

        let (program, args) = shell_command("/usr/bin/fish", "ls", false);
        assert_eq!(program, "/usr/bin/fish");
        assert_eq!(args, vec!["-c", "ls"]);
    }

    #[test]
    fn test_detect_shell_prefers_priority_list() {
        let shell = detect_shell();
        assert!(shell == "bash" || shell == "sh");
    }

    #[tokio::test]
    async fn test_run_step_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let runner = ShellRunner::new(RunnerConfig {
            default_shell: Some("sh".to_string()),
            events,
            ..Default::default()
        });

        let step = Step::run("greet", "echo hello; echo oops >&2");
        let result = runner
            .run_step(&step, &EnvVars::new(), dir.path())
            .await
            .unwrap();

        assert_eq!(result.status, Status::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::StepOutput(out) = event {
                lines.push((out.stream, out.line));
            }
        }
        assert!(lines.contains(&(OutputStream::Stdout, "hello".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn test_run_step_failure_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::run("fail", "echo broken >&2; exit 3");
        let err = runner()
            .run_step(&step, &EnvVars::new(), dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_step_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut step = Step::run("pwd", "echo \"$GREETING\"; basename \"$(pwd)\"")
            .with_env("GREETING", "hi");
        step.working_directory = Some("sub".to_string());

        let env = crate::env::step_env(&std::env::vars().collect(), &step);
        let result = runner().run_step(&step, &env, dir.path()).await.unwrap();
        assert_eq!(result.stdout, "hi\nsub\n");
    }

    #[tokio::test]
    async fn test_step_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner();
        let step = Step::run("slow", "sleep 5");
        let ctx = StepContext {
            job: "j".to_string(),
            step: "slow".to_string(),
            events: EventSink::disabled(),
        };
        let (program, args) = shell_command("sh", "sleep 5", false);
        let mut result = StepResult::new("slow");
        let deadline = JobDeadline {
            at: Instant::now() + Duration::from_millis(200),
            minutes: 1,
        };

        let started = std::time::Instant::now();
        let err = runner
            .attempt(
                &ctx,
                &step,
                &program,
                &args,
                &std::env::vars().collect(),
                dir.path(),
                Some(deadline),
                &mut result,
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_covers_backgrounded_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner();
        let command = "sleep 5 & echo started";
        let step = Step::run("server", command);
        let ctx = StepContext {
            job: "j".to_string(),
            step: "server".to_string(),
            events: EventSink::disabled(),
        };
        let (program, args) = shell_command("sh", command, false);
        let mut result = StepResult::new("server");
        let deadline = JobDeadline {
            at: Instant::now() + Duration::from_millis(300),
            minutes: 1,
        };

        let started = std::time::Instant::now();
        let err = runner
            .attempt(
                &ctx,
                &step,
                &program,
                &args,
                &std::env::vars().collect(),
                dir.path(),
                Some(deadline),
                &mut result,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::JobTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_job_deadline_stops_retries() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner();
        let step = Step::run("slow", "sleep 5")
            .with_retry(RetryPolicy::attempts(3).with_delay("1s"));
        let ctx = StepContext {
            job: "j".to_string(),
            step: "slow".to_string(),
            events: EventSink::disabled(),
        };
        let mut result = StepResult::new("slow");
        let deadline = JobDeadline {
            at: Instant::now() + Duration::from_millis(200),
            minutes: 1,
        };

        let started = std::time::Instant::now();
        let err = runner
            .run_shell_step(
                &ctx,
                &step,
                "sleep 5",
                None,
                &std::env::vars().collect(),
                dir.path(),
                Some(deadline),
                &mut result,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::JobTimeout { minutes: 1 }));
        assert_eq!(result.retries, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_fails_twice_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let script = format!(
            "n=$(cat {0} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {0}; [ $n -ge 3 ]",
            counter.display()
        );
        let step = Step::run("flaky", script)
            .with_retry(RetryPolicy::attempts(3).with_delay("100ms"));

        let started = std::time::Instant::now();
        let result = runner()
            .run_step(&step, &std::env::vars().collect(), dir.path())
            .await
            .unwrap();

        assert_eq!(result.status, Status::Success);
        assert_eq!(result.retries, 2);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_states_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::run("always-fails", "exit 1").with_retry(RetryPolicy::attempts(2));
        let err = runner()
            .run_step(&step, &std::env::vars().collect(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
        assert!(err.to_string().starts_with("All 2 attempts failed"));
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_job_successful() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(
            "build",
            vec![
                Step::run("bad", "exit 1").continuing_on_error(),
                Step::run("good", "true"),
            ],
        );

        let summary = runner().run_job(&job, dir.path()).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.completed_steps, 1);
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let job = job(
            "build",
            vec![
                Step::run("one", "true"),
                Step::run("two", "exit 4"),
                Step::run("three", format!("touch {}", marker.display())),
            ],
        );

        let summary = runner().run_job(&job, dir.path()).await.unwrap();
        assert!(!summary.success);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.steps.len(), 2);
        assert_eq!(summary.steps[1].status, Status::Failed);
        assert_eq!(summary.steps[1].exit_code, Some(4));
        assert!(summary.errors[0].starts_with("Step 'two' failed"));
        assert!(!marker.exists());
        assert!(summary.into_result().is_err());
    }

    #[tokio::test]
    async fn test_failure_guard_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(
            "build",
            vec![
                Step::run("on-failure", "exit 1").with_condition("failure()"),
                Step::run("custom", "true").with_condition("github.event_name == 'push'"),
            ],
        );

        let summary = runner().run_job(&job, dir.path()).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.skipped_steps, 1);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.steps[0].status, Status::Skipped);
    }

    #[tokio::test]
    async fn test_dry_run_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("created");
        let (events, mut rx) = EventSink::channel();
        let runner = ShellRunner::new(RunnerConfig {
            dry_run: true,
            default_shell: Some("sh".to_string()),
            events,
            ..Default::default()
        });
        let job = job(
            "build",
            vec![
                Step::run("touch", format!("touch {}", marker.display())),
                Step::uses("checkout", "actions/checkout@v4"),
            ],
        );

        let summary = runner.run_job(&job, dir.path()).await.unwrap();
        assert!(summary.success);
        assert!(!marker.exists());

        let plans: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::DryRun(d) => Some(d.plan),
                _ => None,
            })
            .collect();
        assert_eq!(plans.len(), 2);
        assert!(plans[0].contains("touch"));
        assert!(plans[1].contains("git fetch --all --tags"));
    }

    #[tokio::test]
    async fn test_missing_workdir_is_an_error() {
        let job = job("build", vec![Step::run("noop", "true")]);
        let err = runner()
            .run_job(&job, Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidWorkdir { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_action_is_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let runner = ShellRunner::new(RunnerConfig {
            events,
            ..Default::default()
        });
        let step = Step::uses("cache", "actions/cache@v4");
        let result = runner
            .run_step(&step, &EnvVars::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(result.status, Status::Success);

        let warned = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| matches!(e, Event::Warning(w) if w.message.contains("actions/cache@v4")));
        assert!(warned);
    }

    #[tokio::test]
    async fn test_job_markers_reach_steps() {
        let dir = tempfile::tempdir().unwrap();
        let job = job("markers", vec![Step::run("print", "echo \"$CI $GIT_CI $JOB_NAME\"")]);
        let summary = runner().run_job(&job, dir.path()).await.unwrap();
        assert_eq!(summary.steps[0].stdout, "true true markers\n");
    }
}
