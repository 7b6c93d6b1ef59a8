mod cmd;
mod output;
mod root;

use bootstrap_core::config::CONFIG_ENV;
use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, plan::PlanArgs, up::UpArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "bootstrap",
    about = "Bring a Kubernetes platform up through ordered, verifiable stages",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from bootstrap.yaml or .git/)
    #[arg(long, global = true, env = "BOOTSTRAP_ROOT")]
    root: Option<PathBuf>,

    /// Config file (default: <root>/bootstrap.yaml, then built-in defaults)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bootstrap stages in order
    Up(UpArgs),

    /// Terminate background processes started by previous runs
    Stop,

    /// Show the last run summary, phase artifacts and supervised processes
    Status,

    /// Show node classification, resource limits and the stage list without changing anything
    Plan(PlanArgs),

    /// Inspect or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Up(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Up(args) => cmd::up::run(&root, config, args, cli.json),
        Commands::Stop => cmd::stop::run(&root, config, cli.json),
        Commands::Status => cmd::status::run(&root, config, cli.json),
        Commands::Plan(args) => cmd::plan::run(&root, config, args, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
