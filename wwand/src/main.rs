use clap::Parser;
use color_eyre::eyre::Result;
use std::path::PathBuf;
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, warn};
use wwand::statsd::dd::DogstatsdClient;
use wwand::telemetry::TelemetryConfig;

const SYSLOG_IDENTIFIER: &str = "wwand";

/// Cellular connection manager daemon.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Object path of the modem to manage on the modem-management service.
    #[arg(long, default_value = "/org/freedesktop/ModemManager1/Modem/0")]
    modem_path: String,

    /// Durable state file for activation and APN records.
    #[arg(long, default_value = "/var/lib/wwand/state.json")]
    store_path: PathBuf,

    /// Carrier APN database image.
    #[arg(long)]
    apn_db: Option<PathBuf>,

    /// Operator id to register on instead of automatic selection.
    #[arg(long)]
    network: Option<String>,

    /// Allow data sessions while roaming.
    #[arg(long, default_value_t = false)]
    allow_roaming: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    TelemetryConfig::new().with_journald(SYSLOG_IDENTIFIER).init();

    let cli = Cli::parse();

    let (capability, tasks) = wwand::program()
        .system_bus(zbus::Connection::system().await?)
        .modem_path(cli.modem_path.try_into()?)
        .store_path(&cli.store_path)
        .maybe_apn_db_path(cli.apn_db)
        .statsd_client(DogstatsdClient::new())
        .maybe_selected_network(cli.network)
        .allow_roaming(cli.allow_roaming)
        .run()
        .await?;

    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sigint = unix::signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => warn!("received SIGTERM"),
        _ = sigint.recv()  => warn!("received SIGINT"),
    }

    info!("stopping modem and exiting gracefully");

    if let Err(e) = capability.stop_modem().await {
        warn!("failed to stop modem on shutdown: {e}");
    }
    capability.shutdown();

    for handle in tasks {
        handle.abort();
    }

    Ok(())
}
