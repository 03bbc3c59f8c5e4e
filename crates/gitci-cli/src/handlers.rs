//! Command handlers.

use crate::commands::RunArgs;
use crate::config::{CliConfig, RunSettings};
use anyhow::{Context, bail};
use console::style;
use gitci_core::events::Event;
use gitci_core::pipeline::{Job, Pipeline, StepAction};
use gitci_core::run::{PipelineRun, Status};
use gitci_core::{EventSink, OutputStream};
use gitci_scheduler::{
    DefaultRunnerFactory, ExecutionMode, JobSelector, Scheduler, ValidationError, Validator,
};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

const TREE_BRANCH: &str = "├──";
const TREE_PIPE: &str = "│  ";
const TREE_END: &str = "└──";
const TREE_SPACE: &str = "   ";

/// Read and parse a normalized pipeline file.
pub fn load_pipeline(path: &Path) -> anyhow::Result<Pipeline> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline {}", path.display()))?;
    Pipeline::from_yaml(&content)
        .with_context(|| format!("failed to parse pipeline {}", path.display()))
}

/// Run the selected jobs of a pipeline.
pub async fn run(args: &RunArgs, config: &CliConfig, verbose: bool) -> anyhow::Result<()> {
    let pipeline = load_pipeline(&args.file)?;
    debug!(pipeline = %pipeline.name, jobs = pipeline.jobs.len(), "Parsed pipeline");

    let errors = Validator::new().validate(&pipeline);
    if !errors.is_empty() {
        print!("{}", validation_report(&errors));
        bail!("pipeline '{}' is invalid", pipeline.name);
    }

    let settings = RunSettings::resolve(args, config, verbose)?;
    let selector = JobSelector::new()
        .job(args.job.clone().unwrap_or_default())
        .stage(args.stage.clone().unwrap_or_default())
        .only(args.only.clone())
        .except(args.except.clone());
    let selected = selector.select(&pipeline)?.len();

    match settings.scheduler_config.mode {
        ExecutionMode::Sequential => println!("Running {} job(s) sequentially", selected),
        ExecutionMode::Parallel { max_parallel } => println!(
            "Running {} job(s) in parallel (max {})",
            selected, max_parallel
        ),
    }
    println!("{}", "-".repeat(80));

    let (events, rx) = EventSink::channel();
    let printer = tokio::spawn(print_events(rx));

    let run = {
        let runner_config = settings
            .runner_config
            .with_pipeline(&pipeline)
            .with_events(events.clone());
        let factory = Arc::new(DefaultRunnerFactory::new(settings.runner, runner_config));
        let scheduler_config = gitci_scheduler::SchedulerConfig {
            events,
            ..settings.scheduler_config
        };
        Scheduler::new(factory, scheduler_config)
            .run(&pipeline, &selector)
            .await
    };
    // Every sink is dropped with the scheduler, which ends the printer.
    let _ = printer.await;
    let run = run?;

    print!("{}", run_summary(&run));
    run.outcome()?;
    Ok(())
}

/// Validate a pipeline file and print the findings.
pub fn validate(file: &Path, strict: bool) -> anyhow::Result<()> {
    let pipeline = load_pipeline(file)?;
    let errors = Validator::new().strict(strict).validate(&pipeline);

    if !errors.is_empty() {
        print!("{}", validation_report(&errors));
        bail!("validation failed with {} error(s)", errors.len());
    }

    print!("{}", validation_summary(&pipeline));
    Ok(())
}

/// Print the pipeline as a tree.
pub fn list(file: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(file)?;
    print!("{}", pipeline_tree(&pipeline));
    Ok(())
}

/// Show the configuration in effect.
pub fn show_config(config: &CliConfig, path: Option<&Path>) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            println!("Configuration from: {}", path.display());
            println!("{}", "=".repeat(60));
        }
        None => {
            println!("No configuration file found, using defaults");
            if let Some(user) = CliConfig::user_config_path() {
                println!("  Searched .git-ci.yml, .github/, .gitlab/ and {}", user.display());
            }
            println!();
        }
    }
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Print the JSON Schema of the pipeline format.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(Pipeline);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Drain the event channel until every sender is gone.
pub async fn print_events(mut rx: UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        println!("{}", render_event(&event));
    }
}

/// One printable block per event.
pub fn render_event(event: &Event) -> String {
    match event {
        Event::JobStarted(e) => format!(
            "{} Job '{}' ({}, {} step(s))",
            style("▶").cyan(),
            style(&e.job).bold(),
            e.runner,
            e.total_steps
        ),
        Event::StepStarted(e) => format!("  [{}/{}] {}", e.index, e.total, style(&e.step).bold()),
        Event::StepOutput(e) => match e.stream {
            OutputStream::Stdout => format!("    {}", e.line),
            OutputStream::Stderr => format!("    {}", style(&e.line).red()),
        },
        Event::StepRetrying(e) => format!(
            "  {} Retrying '{}' (attempt {}/{}) in {}: {}",
            style("↻").yellow(),
            e.step,
            e.attempt,
            e.max_attempts,
            format_duration(Duration::from_millis(e.delay_ms)),
            e.last_error
        ),
        Event::StepCompleted(e) => {
            let result = &e.result;
            let elapsed = format_duration(Duration::from_millis(result.duration_ms));
            match result.status {
                Status::Success => format!("  {} {} ({})", style("✓").green(), result.name, elapsed),
                Status::Skipped => format!("  {} {} (skipped)", style("-").dim(), result.name),
                _ => format!(
                    "  {} {} ({}): {}",
                    style("✗").red(),
                    result.name,
                    elapsed,
                    result.error.as_deref().unwrap_or("failed")
                ),
            }
        }
        Event::JobCompleted(e) => {
            let elapsed = format_duration(Duration::from_millis(e.summary.duration_ms));
            if e.summary.success {
                format!(
                    "{} Job '{}' succeeded in {}",
                    style("✓").green(),
                    e.job,
                    elapsed
                )
            } else {
                format!(
                    "{} Job '{}' failed after {}: {}",
                    style("✗").red(),
                    e.job,
                    elapsed,
                    e.summary.errors.join("; ")
                )
            }
        }
        Event::Warning(e) => match &e.job {
            Some(job) => format!("{} [{}] {}", style("!").yellow(), job, e.message),
            None => format!("{} {}", style("!").yellow(), e.message),
        },
        Event::DryRun(e) => {
            let target = match &e.step {
                Some(step) => format!("{} / {}", e.job, step),
                None => e.job.clone(),
            };
            let mut text = format!("{} {}", style("[dry-run]").magenta(), target);
            for line in e.plan.lines() {
                let _ = write!(text, "\n    {}", line);
            }
            text
        }
    }
}

/// Footer printed after a run.
pub fn run_summary(run: &PipelineRun) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "-".repeat(80));
    let _ = writeln!(
        out,
        "Pipeline completed in {} (run {})",
        format_duration(Duration::from_millis(run.duration_ms)),
        run.id.short()
    );
    let _ = writeln!(
        out,
        "Success: {}, Failed: {}, Total: {}",
        run.succeeded(),
        run.failed(),
        run.total()
    );
    if run.skipped() > 0 || run.cancelled() > 0 {
        let _ = writeln!(
            out,
            "Skipped: {}, Cancelled: {}",
            run.skipped(),
            run.cancelled()
        );
    }
    out
}

pub fn validation_report(errors: &[ValidationError]) -> String {
    let mut out = String::from("Validation errors found:\n");
    let _ = writeln!(out, "{}", "-".repeat(60));
    for (i, error) in errors.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, error);
    }
    let _ = writeln!(out, "{}", "-".repeat(60));
    out
}

pub fn validation_summary(pipeline: &Pipeline) -> String {
    let total_steps: usize = pipeline.jobs.iter().map(|j| j.steps.len()).sum();
    let mut out = format!("✓ Pipeline '{}' is valid\n", pipeline.name);
    out.push_str("\nSummary:\n");
    let _ = writeln!(
        out,
        "  Provider: {}",
        pipeline.provider.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(out, "  Jobs: {}", pipeline.jobs.len());
    let _ = writeln!(out, "  Total steps: {}", total_steps);
    if !pipeline.stages.is_empty() {
        let _ = writeln!(out, "  Stages: {}", pipeline.stages.join(", "));
    }
    out
}

/// Tree view of a pipeline, jobs in declaration order.
pub fn pipeline_tree(pipeline: &Pipeline) -> String {
    let mut out = format!("\nPipeline: {}\n", pipeline.name);
    if let Some(provider) = &pipeline.provider {
        let _ = writeln!(out, "Provider: {}", provider);
    }
    if let Some(description) = &pipeline.description {
        let _ = writeln!(out, "Description: {}", description);
    }

    if !pipeline.stages.is_empty() {
        out.push_str("\nStages:\n");
        push_leaves(&mut out, "", pipeline.stages.iter().map(String::as_str));
    }

    if !pipeline.env.is_empty() {
        out.push_str("\nGlobal Environment:\n");
        let pairs: Vec<String> = pipeline.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        push_leaves(&mut out, "", pairs.iter().map(String::as_str));
    }

    out.push_str("\nJobs:\n");
    let count = pipeline.jobs.len();
    for (i, job) in pipeline.jobs.iter().enumerate() {
        let last = i + 1 == count;
        let (branch, child) = if last {
            (TREE_END, TREE_SPACE)
        } else {
            (TREE_BRANCH, TREE_PIPE)
        };
        let _ = writeln!(out, "{} {}", branch, job.name);
        push_job_details(&mut out, job, child);
    }

    let _ = writeln!(out, "\nTotal: {} jobs", count);
    out
}

fn push_job_details(out: &mut String, job: &Job, prefix: &str) {
    let mut details: Vec<(&str, String)> = Vec::new();
    if let Some(stage) = &job.stage {
        details.push(("Stage", stage.clone()));
    }
    details.push(("Runner", runner_label(job)));
    if let Some(image) = &job.image {
        details.push(("Image", image.clone()));
    }
    if job.timeout_minutes > 0 {
        details.push(("Timeout", format!("{} minutes", job.timeout_minutes)));
    }
    if job.allow_failure || job.continue_on_error {
        details.push(("Allow Failure", "true".to_string()));
    }
    if !job.tags.is_empty() {
        details.push(("Tags", job.tags.join(", ")));
    }
    if !job.needs.is_empty() {
        details.push(("Depends on", job.needs.join(", ")));
    }
    if let Some(trigger) = &job.trigger {
        details.push(("Triggers", trigger.clone()));
    }
    for (label, value) in details {
        let _ = writeln!(out, "{}{} {}: {}", prefix, TREE_BRANCH, label, value);
    }

    let nested = format!("{}{}  ", prefix, TREE_PIPE);
    if !job.env.is_empty() {
        let _ = writeln!(out, "{}{} Environment variables:", prefix, TREE_BRANCH);
        let pairs: Vec<String> = job.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        push_leaves(out, &nested, pairs.iter().map(String::as_str));
    }
    if !job.services.is_empty() {
        let _ = writeln!(out, "{}{} Services:", prefix, TREE_BRANCH);
        let services: Vec<String> = job
            .services
            .iter()
            .map(|(name, service)| format!("{}: {}", name, service.image))
            .collect();
        push_leaves(out, &nested, services.iter().map(String::as_str));
    }
    if let Some(artifacts) = job.artifacts.as_ref().filter(|a| !a.paths.is_empty()) {
        let _ = writeln!(out, "{}{} Artifacts:", prefix, TREE_BRANCH);
        push_leaves(out, &nested, artifacts.paths.iter().map(String::as_str));
    }
    if let Some(cache) = job.cache.as_ref().filter(|c| !c.paths.is_empty()) {
        let _ = writeln!(out, "{}{} Cache:", prefix, TREE_BRANCH);
        push_leaves(out, &nested, cache.paths.iter().map(String::as_str));
    }

    if job.steps.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}{} Steps ({}):", prefix, TREE_END, job.steps.len());
    let steps: Vec<String> = job
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut line = if step.name.is_empty() {
                format!("Step {}", i + 1)
            } else {
                step.name.clone()
            };
            if let StepAction::Uses { reference, .. } = &step.action {
                let _ = write!(line, " (action: {})", reference);
            } else if let Some(shell) = step.shell.as_deref().filter(|s| *s != "bash" && *s != "sh") {
                let _ = write!(line, " (shell: {})", shell);
            }
            if step.timeout_minutes > 0 {
                let _ = write!(line, " (timeout: {}m)", step.timeout_minutes);
            }
            if step.continue_on_error {
                line.push_str(" (continue-on-error)");
            }
            if let Some(dir) = &step.working_directory {
                let _ = write!(line, " (workdir: {})", dir);
            }
            line
        })
        .collect();
    push_leaves(out, &format!("{}{}  ", prefix, TREE_SPACE), steps.iter().map(String::as_str));
}

fn push_leaves<'a>(out: &mut String, prefix: &str, items: impl ExactSizeIterator<Item = &'a str>) {
    let count = items.len();
    for (i, item) in items.enumerate() {
        let branch = if i + 1 == count { TREE_END } else { TREE_BRANCH };
        let _ = writeln!(out, "{}{} {}", prefix, branch, item);
    }
}

fn runner_label(job: &Job) -> String {
    if let Some(runs_on) = &job.runs_on {
        return runs_on.clone();
    }
    if let Some(container) = &job.container {
        if !container.image.is_empty() {
            return container.image.clone();
        }
    }
    if let Some(image) = &job.image {
        return image.clone();
    }
    if !job.tags.is_empty() {
        return format!("tags: {}", job.tags.join(","));
    }
    "default".to_string()
}

/// Human-readable duration: `250ms`, `4.2s`, `3m 5s`, `1h 2m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs / 60) % 60)
    }
}
