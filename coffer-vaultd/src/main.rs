use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use coffer_vaultd::{NullDownloader, ProcessManager, SupervisorOptions, VaultSupervisor};

#[derive(Parser)]
#[command(name = "coffer-vaultd")]
#[command(about = "Vault supervisor: owns vault processes and brokers their identity")]
struct Cli {
    /// Directory for the config file, bootstrap data and vault chunk stores.
    /// Defaults to the working directory if a config file exists there, the
    /// system application directory otherwise.
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coffer_vaultd=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let options = SupervisorOptions::new(
        Arc::new(ProcessManager::new()),
        // Update fetching is deployment-specific; the stock binary only
        // tracks local versions.
        Arc::new(NullDownloader),
    )
    .with_config_dir(cli.config_dir);

    let supervisor = VaultSupervisor::start(options).await?;
    info!(
        "listening on port {}, config at {}",
        supervisor.port(),
        supervisor.config_path().display()
    );

    tokio::signal::ctrl_c().await?;
    supervisor.shutdown().await;
    Ok(())
}
