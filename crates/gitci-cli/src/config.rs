//! CLI configuration management.

use crate::commands::RunArgs;
use anyhow::{Context, bail};
use gitci_core::EnvVars;
use gitci_runner::{DEFAULT_IMAGE, PullPolicy, RunnerConfig, RunnerType};
use gitci_scheduler::{ExecutionMode, JobOrdering, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project-relative locations searched for a config file, in order.
const SEARCH_PATHS: &[&str] = &[
    ".git-ci.yml",
    ".git-ci.yaml",
    ".github/.git-ci.yml",
    ".gitlab/.git-ci.yml",
];

const DEFAULT_TIMEOUT_MINUTES: u64 = 30;

/// CLI configuration, read from `.git-ci.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Variables added to every job.
    #[serde(default, skip_serializing_if = "EnvVars::is_empty")]
    pub environment: EnvVars,
    #[serde(default)]
    pub docker: DockerConfig,
}

/// Defaults for `run` flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DefaultsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerType>,
    /// Job timeout in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering: Option<JobOrdering>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DockerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
}

impl CliConfig {
    /// Load configuration from an explicit path, or from the first file
    /// found by [`CliConfig::find`]. No file means defaults.
    pub fn load(explicit: Option<&Path>, base: &Path) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find(base),
        };
        match path {
            Some(path) => Ok((Self::from_file(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// First config file under `base`, then the user config directory.
    pub fn find(base: &Path) -> Option<PathBuf> {
        SEARCH_PATHS
            .iter()
            .map(|p| base.join(p))
            .chain(Self::user_config_path())
            .find(|p| p.is_file())
    }

    /// Get the per-user configuration file path.
    pub fn user_config_path() -> Option<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "git-ci")?;
        Some(dirs.config_dir().join("config.yml"))
    }
}

/// Everything a run needs, after folding flags over the config file.
#[derive(Debug)]
pub struct RunSettings {
    pub runner: RunnerType,
    pub runner_config: RunnerConfig,
    pub scheduler_config: SchedulerConfig,
}

impl RunSettings {
    /// Flags win over the config file, which wins over built-in defaults.
    pub fn resolve(args: &RunArgs, config: &CliConfig, verbose: bool) -> anyhow::Result<Self> {
        let defaults = &config.defaults;

        let runner = if args.docker {
            RunnerType::Container
        } else {
            args.runner.or(defaults.runner).unwrap_or_default()
        };

        let mut overrides = config.environment.clone();
        if let Some(path) = &args.env_file {
            overrides.extend(read_env_file(path)?);
        }
        for pair in &args.env {
            let (key, value) = parse_env_pair(pair)?;
            overrides.insert(key, value);
        }

        let runner_config = RunnerConfig {
            verbose: verbose || defaults.verbose,
            dry_run: args.dry_run,
            pull_policy: args.pull.or(config.docker.pull).unwrap_or_default(),
            default_image: config
                .docker
                .default_image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            default_shell: args.shell.clone().or_else(|| defaults.shell.clone()),
            timeout_minutes: args
                .timeout
                .or(defaults.timeout)
                .unwrap_or(DEFAULT_TIMEOUT_MINUTES),
            overrides,
            ..Default::default()
        };

        let mode = if args.parallel || defaults.parallel {
            ExecutionMode::parallel(args.max_parallel.or(defaults.max_parallel).unwrap_or(0))
        } else {
            ExecutionMode::Sequential
        };

        let scheduler_config = SchedulerConfig {
            mode,
            ordering: args.ordering.or(defaults.ordering).unwrap_or_default(),
            continue_on_error: args.continue_on_error || defaults.continue_on_error,
            workdir: args.workdir.clone(),
            ..Default::default()
        };

        Ok(Self {
            runner,
            runner_config,
            scheduler_config,
        })
    }
}

/// Split `KEY=VALUE`. The value may itself contain `=`.
pub fn parse_env_pair(pair: &str) -> anyhow::Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("invalid environment variable '{}', expected KEY=VALUE", pair),
    }
}

/// Variables from a dotenv file, without touching the process environment.
pub fn read_env_file(path: &Path) -> anyhow::Result<EnvVars> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to open env file {}", path.display()))?;
    let mut vars = EnvVars::new();
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("failed to parse env file {}", path.display()))?;
        vars.insert(key, value);
    }
    Ok(vars)
}
