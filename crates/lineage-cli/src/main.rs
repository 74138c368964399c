use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use lineage_core::config::{load_settings, load_settings_file, merge_settings};
use lineage_core::tracing_init::init_tracing;
use lineage_orchestrator::{ChildProcessTask, RestConnector};
use tracing::info;
use uuid::Uuid;

use lineage_cli::commands::{self, Command, Host};

/// Drive child processes on a remote process service.
#[derive(Debug, Parser)]
#[command(name = "lineage", version, about)]
struct Cli {
    /// Extra settings file, applied over the global and project files
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Project directory holding `.lineage/settings.json` (default: current dir)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// File holding the execution's persisted state
    #[arg(long, global = true, default_value = ".lineage/state.json")]
    state: PathBuf,

    /// Identifier of the calling execution
    #[arg(long, global = true, env = "LINEAGE_INSTANCE_ID")]
    instance_id: Option<Uuid>,

    /// Directory payload paths are resolved against (default: current dir)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Organization of the calling execution
    #[arg(long, global = true)]
    org: Option<String>,

    /// Process service URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Process service API key
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir()?;
    let project_dir = cli.project_dir.clone().unwrap_or_else(|| cwd.clone());
    let mut settings = load_settings(Some(&project_dir))?;
    if let Some(path) = &cli.settings {
        merge_settings(&mut settings, load_settings_file(path)?);
    }
    if cli.base_url.is_some() {
        settings.client.base_url.clone_from(&cli.base_url);
    }
    if cli.api_key.is_some() {
        settings.client.api_key.clone_from(&cli.api_key);
    }
    settings.log_json |= cli.log_json;

    init_tracing("lineage=info", settings.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting lineage");

    let connector = RestConnector::new(&settings.client)?;
    let host = Host {
        task: ChildProcessTask::new(Arc::new(connector), &settings),
        state_path: cli.state,
        instance_id: cli.instance_id,
        work_dir: cli.work_dir.unwrap_or(cwd),
        org: cli.org,
    };

    let mut out = io::stdout();
    commands::run(&host, cli.command, &mut out).await
}
