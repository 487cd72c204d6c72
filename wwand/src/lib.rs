use crate::apn_db::{ApnDatabase, JsonApnDatabase, NullApnDatabase};
use crate::capability::ModemCapability;
use crate::modem_manager::dbus::ModemManagerDbus;
use crate::statsd::StatsdClient;
use crate::store::Store;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{info, warn};

pub mod activation;
pub mod apn;
pub mod apn_db;
pub mod capability;
pub mod modem_manager;
pub mod registration;
pub mod sim_lock;
pub mod statsd;
pub mod step_chain;
pub mod store;
pub mod telemetry;

pub(crate) type Tasks = Vec<JoinHandle<Result<()>>>;

/// Wire the store, database, RPC client and capability together and bring
/// the modem up. Returns the capability handle for the device layer plus the
/// background tasks to supervise.
#[bon::builder(finish_fn = run)]
pub async fn program(
    system_bus: zbus::Connection,
    modem_path: zbus::zvariant::OwnedObjectPath,
    store_path: impl AsRef<Path>,
    apn_db_path: Option<PathBuf>,
    statsd_client: impl StatsdClient,
    selected_network: Option<String>,
    #[builder(default = false)] allow_roaming: bool,
) -> Result<(ModemCapability, Tasks)> {
    let rpc = ModemManagerDbus::new(&system_bus, modem_path).await?;
    let family = rpc.technology_family().await?;
    let (signals, signal_tasks) = rpc.spawn_signals().await?;

    let store = Arc::new(Store::open(store_path.as_ref()).await?);
    let apn_db: Arc<dyn ApnDatabase> = match apn_db_path {
        Some(path) => Arc::new(JsonApnDatabase::load(path).await?),
        None => {
            warn!("no apn database configured, connects rely on overrides and history");
            Arc::new(NullApnDatabase)
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let (capability, loop_task) = ModemCapability::builder()
        .rpc(Arc::new(rpc))
        .signals(signals)
        .store(store)
        .apn_db(apn_db)
        .events(events_tx)
        .statsd(statsd_client)
        .family(family)
        .maybe_selected_network(selected_network)
        .allow_roaming(allow_roaming)
        .spawn();

    if let Err(e) = capability.start_modem().await {
        warn!("failed to start modem, continuing degraded: {e}");
    }

    let mut tasks: Tasks = Vec::new();
    for handle in signal_tasks.into_iter().chain([loop_task]) {
        tasks.push(task::spawn(async move {
            handle.await?;
            Ok(())
        }));
    }

    // The host device layer consumes these through its own adaptors; the
    // daemon shell just journals them.
    tasks.push(task::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            info!(?event, "capability event");
        }
        Ok(())
    }));

    Ok((capability, tasks))
}
