#![allow(dead_code)]
use async_tempfile::TempDir;
use async_trait::async_trait;
use color_eyre::Result;
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use wwand::apn_db::JsonApnDatabase;
use wwand::capability::ModemCapability;
use wwand::modem_manager::{
    BearerPath, ConnectProperties, Modem3gppProperties, ModemHardwareInfo,
    ModemManager, ModemProperties, ModemSignal, PowerState, Result as ModemResult,
    ScanResult, SimProperties, TechnologyFamily,
};
use wwand::statsd::StatsdClient;
use wwand::store::Store;
use wwand_events::Event;

pub const APN_DB: &str = r#"{
    "26202": {
        "name": "Vodafone",
        "country": "de",
        "spn": "vodafone.de",
        "apns": [{ "apn": "web.vodafone.de" }, { "apn": "event.vodafone.de" }]
    }
}"#;

mock! {
    pub Modem {}

    #[async_trait]
    impl ModemManager for Modem {
        async fn enable(&self, enable: bool) -> ModemResult<()>;
        async fn reset(&self) -> ModemResult<()>;
        async fn set_power_state(&self, state: PowerState) -> ModemResult<()>;
        async fn register(&self, operator_code: &str) -> ModemResult<()>;
        async fn scan(&self) -> ModemResult<Vec<ScanResult>>;
        async fn connect(&self, props: ConnectProperties) -> ModemResult<BearerPath>;
        async fn disconnect_all(&self) -> ModemResult<()>;
        async fn get_imei(&self) -> ModemResult<String>;
        async fn get_imsi(&self) -> ModemResult<String>;
        async fn get_spn(&self) -> ModemResult<String>;
        async fn get_msisdn(&self) -> ModemResult<String>;
        async fn get_modem_info(&self) -> ModemResult<ModemHardwareInfo>;
        async fn get_modem_properties(&self) -> ModemResult<ModemProperties>;
        async fn get_modem3gpp_properties(&self) -> ModemResult<Modem3gppProperties>;
        async fn get_sim_properties(&self) -> ModemResult<SimProperties>;
        async fn require_pin(&self, pin: &str, require: bool) -> ModemResult<()>;
        async fn enter_pin(&self, pin: &str) -> ModemResult<()>;
        async fn unblock_pin(&self, puk: &str, new_pin: &str) -> ModemResult<()>;
        async fn change_pin(&self, old_pin: &str, new_pin: &str) -> ModemResult<()>;
    }
}

/// Benign defaults for everything a happy-path start touches. Expectations
/// match in the order they were added, so register any per-test overrides
/// before calling this.
pub fn fill_defaults(rpc: &mut MockModem) {
    rpc.expect_enable().returning(|_| Ok(()));
    rpc.expect_set_power_state().returning(|_| Ok(()));
    rpc.expect_disconnect_all().returning(|| Ok(()));
    rpc.expect_get_imei().returning(|| Ok("353338976168895".into()));
    rpc.expect_get_imsi().returning(|| Ok("262021234567890".into()));
    rpc.expect_get_spn().returning(|| Ok("vodafone.de".into()));
    rpc.expect_get_msisdn().returning(|| Ok("15551234567".into()));
    rpc.expect_get_modem_info()
        .returning(|| Ok(ModemHardwareInfo::default()));
    rpc.expect_get_modem_properties()
        .returning(|| Ok(ModemProperties::default()));
    rpc.expect_get_modem3gpp_properties()
        .returning(|| Ok(Modem3gppProperties::default()));
    rpc.expect_get_sim_properties()
        .returning(|| Ok(SimProperties::default()));
}

/// Mock with benign defaults for everything a happy-path start touches.
pub fn quiet_modem() -> MockModem {
    let mut rpc = MockModem::new();
    fill_defaults(&mut rpc);
    rpc
}

pub struct NullStatsd;

impl StatsdClient for NullStatsd {
    async fn count<S: AsRef<str> + Sync + Send>(
        &self,
        _stat: &str,
        _count: i64,
        _tags: &[S],
    ) -> Result<()> {
        Ok(())
    }

    async fn gauge<S: AsRef<str> + Sync + Send>(
        &self,
        _stat: &str,
        _val: &str,
        _tags: &[S],
    ) -> Result<()> {
        Ok(())
    }
}

/// Hand-rolled stub whose enable(true), reset and connect park until
/// [`SlowModem::release`] fires. Everything else succeeds immediately.
#[derive(Clone, Default)]
pub struct SlowModem {
    gate: Arc<Notify>,
}

impl SlowModem {
    /// Lets exactly one parked call through (a permit is stored if none is
    /// parked yet).
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl ModemManager for SlowModem {
    async fn enable(&self, enable: bool) -> ModemResult<()> {
        if enable {
            self.gate.notified().await;
        }
        Ok(())
    }

    async fn reset(&self) -> ModemResult<()> {
        self.gate.notified().await;
        Ok(())
    }

    async fn set_power_state(&self, _state: PowerState) -> ModemResult<()> {
        Ok(())
    }

    async fn register(&self, _operator_code: &str) -> ModemResult<()> {
        Ok(())
    }

    async fn scan(&self) -> ModemResult<Vec<ScanResult>> {
        Ok(Vec::new())
    }

    async fn connect(&self, _props: ConnectProperties) -> ModemResult<BearerPath> {
        self.gate.notified().await;
        Ok(BearerPath("/bearer/0".into()))
    }

    async fn disconnect_all(&self) -> ModemResult<()> {
        Ok(())
    }

    async fn get_imei(&self) -> ModemResult<String> {
        Ok(String::new())
    }

    async fn get_imsi(&self) -> ModemResult<String> {
        Ok(String::new())
    }

    async fn get_spn(&self) -> ModemResult<String> {
        Ok(String::new())
    }

    async fn get_msisdn(&self) -> ModemResult<String> {
        Ok(String::new())
    }

    async fn get_modem_info(&self) -> ModemResult<ModemHardwareInfo> {
        Ok(ModemHardwareInfo::default())
    }

    async fn get_modem_properties(&self) -> ModemResult<ModemProperties> {
        Ok(ModemProperties::default())
    }

    async fn get_modem3gpp_properties(&self) -> ModemResult<Modem3gppProperties> {
        Ok(Modem3gppProperties::default())
    }

    async fn get_sim_properties(&self) -> ModemResult<SimProperties> {
        Ok(SimProperties::default())
    }

    async fn require_pin(&self, _pin: &str, _require: bool) -> ModemResult<()> {
        Ok(())
    }

    async fn enter_pin(&self, _pin: &str) -> ModemResult<()> {
        Ok(())
    }

    async fn unblock_pin(&self, _puk: &str, _new_pin: &str) -> ModemResult<()> {
        Ok(())
    }

    async fn change_pin(&self, _old_pin: &str, _new_pin: &str) -> ModemResult<()> {
        Ok(())
    }
}

pub struct Fixture {
    pub capability: ModemCapability,
    pub events: UnboundedReceiver<Event>,
    pub signals: UnboundedSender<ModemSignal>,
    pub store: Arc<Store>,
    pub task: JoinHandle<()>,
    _dir: TempDir,
}

impl Fixture {
    pub async fn new(rpc: impl ModemManager, family: TechnologyFamily) -> Self {
        Self::with_network(rpc, family, None).await
    }

    pub async fn with_network(
        rpc: impl ModemManager,
        family: TechnologyFamily,
        selected_network: Option<String>,
    ) -> Self {
        let dir = TempDir::new().await.unwrap();
        let store = Arc::new(
            Store::open(dir.to_path_buf().join("state.json"))
                .await
                .unwrap(),
        );
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let rpc: Arc<dyn ModemManager> = Arc::new(rpc);

        let (capability, task) = ModemCapability::builder()
            .rpc(rpc)
            .signals(signal_rx)
            .store(Arc::clone(&store))
            .apn_db(Arc::new(JsonApnDatabase::from_json(APN_DB).unwrap()))
            .events(event_tx)
            .statsd(NullStatsd)
            .family(family)
            .maybe_selected_network(selected_network)
            .spawn();

        Self {
            capability,
            events: event_rx,
            signals: signal_tx,
            store,
            task,
            _dir: dir,
        }
    }

    pub fn send(&self, signal: ModemSignal) {
        self.signals.send(signal).unwrap();
    }

    /// Wait until the capability's identity snapshot satisfies the predicate.
    pub async fn wait_identity(
        &self,
        pred: impl Fn(&wwand::capability::DeviceIdentity) -> bool,
    ) {
        time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&self.capability.identity().await.unwrap()) {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for identity change")
    }

    /// Wait until the durable store holds (or no longer holds) an entry.
    pub async fn wait_store(&self, namespace: &str, key: &str, expect: Option<&str>) {
        time::timeout(Duration::from_secs(5), async {
            loop {
                if self.store.get(namespace, key).as_deref() == expect {
                    return;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for store change")
    }

    /// Next event matching the filter; unrelated events are skipped.
    pub async fn next_event<T>(&mut self, mut filter: impl FnMut(&Event) -> Option<T>) -> T {
        time::timeout(Duration::from_secs(30), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if let Some(found) = filter(&event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }
}
