use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleet_core::UserCommand;
use fleet_plan::Level;

mod commands;

#[derive(Parser)]
#[command(
    name = "fleetctl",
    about = "Fleet control plane: write desired state, read worker status",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Domain config file (required by every command).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand role plans into per-worker START documents
    Start {
        #[arg(long, default_value = "all")]
        role: String,
    },
    /// Stop every known worker of a role
    Stop {
        #[arg(long, default_value = "all")]
        role: String,
    },
    /// Tear down every known worker of a role and drop its documents
    Remove {
        #[arg(long, default_value = "all")]
        role: String,
    },
    /// Restart every worker of a role from its configured plan
    Restart {
        #[arg(long, default_value = "all")]
        role: String,
    },
    /// Refresh config without changing data locations
    Upc {
        #[arg(long)]
        role: String,
    },
    /// Point a role's workers at a new data location
    Upf {
        #[arg(long = "index_name", alias = "index-name")]
        index_name: String,
        #[arg(long = "index_path", alias = "index-path")]
        index_path: String,
        #[arg(long, default_value = "searcher")]
        role: String,
    },
    /// Push a package to already-running workers
    Deploy {
        #[arg(long, default_value = "all")]
        role: String,
    },
    /// Print worker status from applied state and heartbeats
    Gs {
        #[arg(long, default_value = "all")]
        role: String,
        /// summary or detail
        #[arg(long, default_value = "summary")]
        level: Level,
    },
}

fn execute(cli: Cli) -> anyhow::Result<String> {
    let config = cli
        .config
        .ok_or_else(|| anyhow::anyhow!("--config <path-to-domain-config> is required"))?;
    let api = commands::open(&config)?;
    match cli.command {
        Commands::Start { role } => commands::plan::submit(&api, &role, UserCommand::Start),
        Commands::Stop { role } => commands::plan::submit(&api, &role, UserCommand::Stop),
        Commands::Remove { role } => commands::plan::submit(&api, &role, UserCommand::Remove),
        Commands::Restart { role } => commands::plan::submit(&api, &role, UserCommand::Restart),
        Commands::Upc { role } => commands::plan::submit(&api, &role, UserCommand::Upc),
        Commands::Upf {
            index_name,
            index_path,
            role,
        } => commands::plan::update_data(&api, &role, &index_name, &index_path),
        Commands::Deploy { role } => commands::plan::submit(&api, &role, UserCommand::Dp),
        Commands::Gs { role, level } => commands::status::gs(&api, &role, level),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    print!("{}", execute(cli)?);
    Ok(())
}
