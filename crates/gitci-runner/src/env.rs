//! Environment layering.
//!
//! Later layers override earlier ones: host environment, runner markers,
//! pipeline env, job env, run-level overrides, then step env.

use crate::runner::{RunnerConfig, RunnerType};
use gitci_core::pipeline::{EnvVars, Job, Step};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Merge layers left to right.
pub fn merge<'a>(layers: impl IntoIterator<Item = &'a EnvVars>) -> EnvVars {
    let mut merged = EnvVars::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Variables every runner injects into a job.
pub fn runner_markers(runner: RunnerType, job: &Job, workspace: &str) -> EnvVars {
    let mut markers = EnvVars::new();
    markers.insert("CI".to_string(), "true".to_string());
    markers.insert("GIT_CI".to_string(), "true".to_string());
    markers.insert("GIT_CI_RUNNER".to_string(), runner.to_string());
    markers.insert("JOB_NAME".to_string(), job.name.clone());
    markers.insert("WORKSPACE".to_string(), workspace.to_string());
    markers
}

/// `GIT_BRANCH` and `GIT_COMMIT` when `workdir` is a git checkout.
pub async fn git_markers(workdir: &Path) -> EnvVars {
    let mut markers = EnvVars::new();
    if let Some(branch) = git_output(workdir, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
        markers.insert("GIT_BRANCH".to_string(), branch);
    }
    if let Some(commit) = git_output(workdir, &["rev-parse", "HEAD"]).await {
        markers.insert("GIT_COMMIT".to_string(), commit);
    }
    markers
}

async fn git_output(workdir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!(args = ?args, "git probe failed");
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Job environment for the process runner.
pub fn process_job_env(config: &RunnerConfig, markers: &EnvVars, job: &Job) -> EnvVars {
    let host: EnvVars = if config.inherit_host_env {
        std::env::vars().collect()
    } else {
        EnvVars::new()
    };
    merge([
        &host,
        markers,
        &config.pipeline_env,
        &job.env,
        &config.overrides,
    ])
}

/// Job environment for the container runner. The host environment never
/// leaks into containers.
pub fn container_job_env(config: &RunnerConfig, markers: &EnvVars, job: &Job) -> EnvVars {
    let container_env = job
        .container
        .as_ref()
        .map(|c| c.env.clone())
        .unwrap_or_default();
    merge([
        markers,
        &config.pipeline_env,
        &job.env,
        &container_env,
        &config.overrides,
    ])
}

pub fn step_env(job_env: &EnvVars, step: &Step) -> EnvVars {
    merge([job_env, &step.env])
}
