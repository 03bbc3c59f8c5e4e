//! CLI command definitions.

use clap::{Args, Subcommand};
use gitci_runner::{PullPolicy, RunnerType};
use gitci_scheduler::JobOrdering;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run pipeline jobs locally
    #[command(alias = "r", alias = "exec")]
    Run(RunArgs),

    /// Validate a pipeline
    #[command(alias = "check")]
    Validate {
        /// Path to the normalized pipeline file
        #[arg(short, long, default_value = "pipeline.yml")]
        file: PathBuf,

        /// Also check runners, timeouts, env keys and artifact paths
        #[arg(long)]
        strict: bool,
    },

    /// List jobs and their configuration
    #[command(alias = "ls")]
    List {
        /// Path to the normalized pipeline file
        #[arg(short, long, default_value = "pipeline.yml")]
        file: PathBuf,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Print the JSON Schema of the pipeline format
    Schema,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to the normalized pipeline file
    #[arg(short, long, default_value = "pipeline.yml")]
    pub file: PathBuf,

    /// Directory the jobs run in
    #[arg(short, long, default_value = ".")]
    pub workdir: PathBuf,

    /// Run one job by name, or every job matching a wildcard pattern
    #[arg(short, long)]
    pub job: Option<String>,

    /// Run only the jobs of a stage
    #[arg(short, long)]
    pub stage: Option<String>,

    /// Keep only jobs matching these patterns
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Drop jobs matching these patterns
    #[arg(long, value_delimiter = ',')]
    pub except: Vec<String>,

    /// Execution backend: process or container
    #[arg(long)]
    pub runner: Option<RunnerType>,

    /// Shorthand for --runner container
    #[arg(short, long, conflicts_with = "runner")]
    pub docker: bool,

    /// Shell used when the pipeline names none
    #[arg(long)]
    pub shell: Option<String>,

    /// Show what would be executed without running it
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Run jobs in parallel
    #[arg(short, long)]
    pub parallel: bool,

    /// Maximum concurrent jobs (0 = one per CPU)
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Keep running after a job fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Honor `needs` (needs) or run as declared (unordered)
    #[arg(long)]
    pub ordering: Option<JobOrdering>,

    /// Image pull policy: always, if-not-present or never
    #[arg(long)]
    pub pull: Option<PullPolicy>,

    /// Default job timeout in minutes (0 = none)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Extra environment variable (KEY=VALUE)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Load extra environment variables from a dotenv file
    #[arg(long)]
    pub env_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration in effect
    Show,
}
