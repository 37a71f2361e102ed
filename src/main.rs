use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "flowstack")]
#[command(version, about = "Run a local workflow-orchestration stack on your container engine")]
pub struct Cli {
    /// Log level: error, warn, info, debug or trace
    #[arg(long, global = true)]
    pub verbosity: Option<String>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the project image and start every service
    Start {
        /// Env file to pass to the services, relative to the project directory
        #[arg(long)]
        env: Option<String>,

        /// Build the image without the layer cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Stop running containers, keeping their data
    Stop,
    /// Remove containers, networks and volumes
    Kill,
    /// List project containers
    Ps,
    /// Show service logs
    Logs {
        #[arg(short, long)]
        follow: bool,
        #[arg(long)]
        webserver: bool,
        #[arg(long)]
        scheduler: bool,
        #[arg(long)]
        triggerer: bool,
    },
    /// Run a command in the webserver container
    Run {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Build the project image
    Build {
        #[arg(long)]
        no_cache: bool,
    },
    /// Push the project image to the deployment registry
    Push {
        /// Remote tag
        #[arg(long)]
        tag: String,

        /// Registry domain; defaults to the configured cloud domain
        #[arg(long)]
        domain: Option<String>,

        #[arg(long, env = "FLOWSTACK_REGISTRY_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Print the labels of the project image
    Labels,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    flowstack::logging::init_logging(cli.verbosity.as_deref())?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Start { env, no_cache } => {
            cmd::cmd_start(&project_dir, env.as_deref(), *no_cache).await?
        }
        Commands::Stop => cmd::cmd_stop(&project_dir).await?,
        Commands::Kill => cmd::cmd_kill(&project_dir).await?,
        Commands::Ps => cmd::cmd_ps(&project_dir).await?,
        Commands::Logs {
            follow,
            webserver,
            scheduler,
            triggerer,
        } => {
            let selection = cmd::LogSelection {
                webserver: *webserver,
                scheduler: *scheduler,
                triggerer: *triggerer,
            };
            cmd::cmd_logs(&project_dir, *follow, selection).await?
        }
        Commands::Run { user, args } => cmd::cmd_run(&project_dir, args, user.as_deref()).await?,
        Commands::Build { no_cache } => cmd::cmd_build(&project_dir, *no_cache).await?,
        Commands::Push { tag, domain, token } => {
            cmd::cmd_push(&project_dir, tag, domain.as_deref(), token.as_deref()).await?
        }
        Commands::Labels => cmd::cmd_labels(&project_dir).await?,
    }

    Ok(())
}
