use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use elemntary::config::{AppConfig, DEFAULT_CONFIG_PATH};
use elemntary::rpc::RpcClient;
use elemntary::{adapters, context::AppContext, core::Orchestrator, db, logging};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "elemntary")]
#[command(about = "Manage ELEMNT bike computers over adb", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to read
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration daemon
    Daemon(ServerArgs),
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Show daemon health
    Status,
    /// List attached devices
    Devices,
    /// List a device's features
    Features { device_id: String },
    /// Show tracked jobs and their progress
    Jobs,
    /// Show persisted job history
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        status: Option<String>,
    },
    /// Call any RPC method, e.g. `call backup.create '{"device_id":"R5CT1"}'`
    Call {
        method: String,
        /// JSON params
        params: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default configuration
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    adb_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    web_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    screenshot_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::load(&cli.config, Some(args))?,
        _ => AppConfig::load(&cli.config, None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Config {
            command: ConfigCommand::Init { force },
        } => {
            AppConfig::default().write_to(&cli.config, force)?;
            println!("Wrote {}", cli.config.display());
        }
        Commands::Status => print_call(&config, "daemon.status", None).await?,
        Commands::Devices => print_call(&config, "devices.list", None).await?,
        Commands::Features { device_id } => {
            print_call(
                &config,
                "features.list",
                Some(json!({ "device_id": device_id })),
            )
            .await?
        }
        Commands::Jobs => print_call(&config, "jobs.active", None).await?,
        Commands::History { limit, status } => {
            print_call(
                &config,
                "jobs.history",
                Some(json!({ "limit": limit, "status": status })),
            )
            .await?
        }
        Commands::Call { method, params } => {
            let params = params
                .map(|p| serde_json::from_str::<Value>(&p))
                .transpose()
                .context("params must be valid JSON")?;
            print_call(&config, &method, params).await?
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init((&config).into());

    let conn = db::open(&config.database_path).await?;
    let bridge = adapters::get_bridge(&config);
    let orchestrator = Orchestrator::new(AppContext::new(config, conn), bridge);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!(error = %e, "Cannot listen for interrupts"),
            }
        });
    }

    orchestrator.start(shutdown).await
}

async fn print_call(config: &AppConfig, method: &str, params: Option<Value>) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let result: Value = client
        .call(method, params)
        .await
        .with_context(|| format!("{} failed", method))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
