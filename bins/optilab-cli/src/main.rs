mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "optilab-cli")]
#[command(about = "Optilab CLI - Submit executions and inspect results", long_about = None)]
struct Cli {
    /// Gateway base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:3000")]
    gateway: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a problem + optimizer execution
    Submit {
        /// Problem repository as owner/name (e.g. alice/tsp)
        #[arg(short, long)]
        problem: String,

        /// Optimizer repository as owner/name (e.g. bob/genetic)
        #[arg(short, long)]
        optimizer: String,

        /// Problem parameter overrides as a JSON object
        #[arg(long, default_value = "{}")]
        problem_params: String,

        /// Optimizer parameter overrides as a JSON object
        #[arg(long, default_value = "{}")]
        optimizer_params: String,

        /// Per-execution deadline override in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Poll until the execution reaches a terminal state
        #[arg(long, default_value = "false")]
        wait: bool,
    },

    /// Fetch the result of an execution
    Result {
        /// Execution id returned by submit
        #[arg(short, long)]
        id: String,
    },

    /// Scaffold a default runtime config for the gateway
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            problem,
            optimizer,
            problem_params,
            optimizer_params,
            timeout_secs,
            wait,
        } => {
            commands::submit(
                &cli.gateway,
                &problem,
                &optimizer,
                &problem_params,
                &optimizer_params,
                timeout_secs,
                wait,
            )
            .await?;
        }
        Commands::Result { id } => {
            commands::fetch_result(&cli.gateway, &id).await?;
        }
        Commands::Init { path } => {
            commands::init_project(&path)?;
        }
    }

    Ok(())
}
