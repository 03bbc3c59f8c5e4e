//! git-ci CLI entrypoint.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;


use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "git-ci")]
#[command(author, version, about = "Run CI/CD pipelines locally", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Configuration file (default: search for .git-ci.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let cwd = std::env::current_dir()?;
    let (config, config_path) = CliConfig::load(cli.config.as_deref(), &cwd)?;
    let verbose = cli.verbose > 0;

    match cli.command {
        Commands::Run(args) => handlers::run(&args, &config, verbose).await?,
        Commands::Validate { file, strict } => handlers::validate(&file, strict)?,
        Commands::List { file } => handlers::list(&file)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config, config_path.as_deref())?,
        },
        Commands::Schema => handlers::schema()?,
    }

    Ok(())
}
