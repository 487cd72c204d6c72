//! The modem capability: one modem's life-cycle behind a message loop.
//!
//! [`ModemCapability`] is a cheap cloneable handle; the state itself lives in
//! a single loop task that owns the trackers and serializes every mutation.
//! Long-running work (enable/disable chains, connect negotiation, plain RPC
//! forwards) runs in driver tasks that only talk to the RPC client and report
//! back over the internal channel, so the loop never blocks and signals keep
//! flowing while an operation is in flight. Destroying the capability cancels
//! the loop and aborts the drivers; late completions land in closed channels
//! and are discarded.

use crate::activation::{ActivationTracker, SubscriptionState, REGISTRATION_WAIT_TIMEOUT};
use crate::apn::{ApnCandidate, ApnNegotiator};
use crate::apn_db::{ApnDatabase, CarrierInfo};
use crate::modem_manager::{
    BearerPath, Modem3gppProperties, ModemError, ModemHardwareInfo, ModemManager,
    ModemProperties, ModemSignal, ModemState, PowerState, PropertiesChanged, Result,
    ScanResult, SimProperties, TechnologyFamily,
};
use crate::registration::{
    DebounceDecision, RegistrationState, RegistrationTracker, RegistrationUpdate,
    DROP_TIMEOUT,
};
use crate::sim_lock::{SimLockTracker, SimLockType};
use crate::statsd::{stats, StatsdClient};
use crate::step_chain::StepChain;
use crate::store::Store;
use bon::bon;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wwand_events::Event;

mod classic;
mod universal;

const NO_TAGS: &[&str] = &[];

type Reply<T> = oneshot::Sender<Result<T>>;

/// Identity the capability has learned about the modem and its SIM.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    pub spn: Option<String>,
    pub mdn: Option<String>,
    pub hardware: Option<ModemHardwareInfo>,
    pub home_operator_id: Option<String>,
    pub carrier: Option<CarrierInfo>,
    pub sim_present: bool,
}

enum Command {
    StartModem { reply: Reply<()> },
    StopModem { reply: Reply<()> },
    Connect { user_apn: Option<ApnCandidate>, reply: Reply<BearerPath> },
    Disconnect { reply: Reply<()> },
    Reset { reply: Reply<()> },
    CompleteActivation { reply: Reply<()> },
    Scan { reply: Reply<Vec<ScanResult>> },
    RequirePin { pin: String, require: bool, reply: Reply<()> },
    EnterPin { pin: String, reply: Reply<()> },
    UnblockPin { puk: String, new_pin: String, reply: Reply<()> },
    ChangePin { old_pin: String, new_pin: String, reply: Reply<()> },
    Identity { reply: oneshot::Sender<DeviceIdentity> },
}

/// Reports from driver tasks back into the loop.
pub(crate) enum Internal {
    Properties(PropertiesChanged),
    HardwareInfo(ModemHardwareInfo),
    HomeProviderReset,
    EnableDeferred,
    StartDone(Result<()>),
    StopDone(Result<()>),
    ConnectDone(Result<BearerPath>),
    DisconnectDone,
    ResetDone,
    ActivationResetDone(bool),
}

/// Everything a chain step needs, cheap to clone into the step closures.
#[derive(Clone)]
pub(crate) struct ChainCtx {
    pub rpc: Arc<dyn ModemManager>,
    pub tx: mpsc::UnboundedSender<Internal>,
    pub state_rx: watch::Receiver<ModemState>,
    pub selected_network: Option<String>,
    pub device_enabled: bool,
    pub device_registered: bool,
}

impl ChainCtx {
    pub fn send(&self, msg: Internal) {
        let _ = self.tx.send(msg);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainKind {
    Start,
    Stop,
}

struct InflightChain {
    kind: ChainKind,
    task: JoinHandle<()>,
    reply: Reply<()>,
}

struct InflightConnect {
    task: JoinHandle<()>,
    /// None for auto-connect attempts nobody is waiting on.
    reply: Option<Reply<BearerPath>>,
}

/// Handle to one modem's capability loop.
#[derive(Clone)]
pub struct ModemCapability {
    cmds: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

#[bon]
impl ModemCapability {
    /// Build the capability and spawn its loop. The protocol variant is
    /// fixed here from the modem's reported technology family.
    #[builder(finish_fn = spawn)]
    pub fn new<S: StatsdClient>(
        rpc: Arc<dyn ModemManager>,
        signals: mpsc::UnboundedReceiver<ModemSignal>,
        store: Arc<Store>,
        apn_db: Arc<dyn ApnDatabase>,
        events: mpsc::UnboundedSender<Event>,
        statsd: S,
        family: TechnologyFamily,
        selected_network: Option<String>,
        #[builder(default = false)] allow_roaming: bool,
        #[builder(default = DROP_TIMEOUT)] registration_drop_timeout: Duration,
        #[builder(default = REGISTRATION_WAIT_TIMEOUT)]
        activation_registration_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (modem_state_tx, _) = watch::channel(ModemState::Unknown);
        let cancel = CancellationToken::new();

        info!(%family, "setting up modem capability");

        let cap_loop = CapabilityLoop {
            rpc,
            family,
            store: Arc::clone(&store),
            apn_db,
            events,
            statsd,
            cmds: cmd_rx,
            signals,
            internal_tx,
            internal_rx,
            cancel: cancel.clone(),
            modem_state_tx,
            registration: RegistrationTracker::with_drop_timeout(
                registration_drop_timeout,
            ),
            sim_lock: SimLockTracker::new(),
            activation: ActivationTracker::with_registration_timeout(
                store,
                activation_registration_timeout,
            ),
            identity: DeviceIdentity::default(),
            selected_network,
            allow_roaming,
            started: false,
            resetting: false,
            bearer: None,
            chain: None,
            pending_connect: None,
        };

        let handle = Self {
            cmds: cmd_tx,
            cancel,
        };

        (handle, task::spawn(cap_loop.run()))
    }

    pub async fn start_modem(&self) -> Result<()> {
        self.request(|reply| Command::StartModem { reply }).await
    }

    pub async fn stop_modem(&self) -> Result<()> {
        self.request(|reply| Command::StopModem { reply }).await
    }

    pub async fn connect(&self, user_apn: Option<ApnCandidate>) -> Result<BearerPath> {
        self.request(|reply| Command::Connect { user_apn, reply }).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn complete_activation(&self) -> Result<()> {
        self.request(|reply| Command::CompleteActivation { reply })
            .await
    }

    pub async fn scan(&self) -> Result<Vec<ScanResult>> {
        self.request(|reply| Command::Scan { reply }).await
    }

    pub async fn require_pin(&self, pin: &str, require: bool) -> Result<()> {
        let pin = pin.to_owned();
        self.request(|reply| Command::RequirePin { pin, require, reply })
            .await
    }

    pub async fn enter_pin(&self, pin: &str) -> Result<()> {
        let pin = pin.to_owned();
        self.request(|reply| Command::EnterPin { pin, reply }).await
    }

    pub async fn unblock_pin(&self, puk: &str, new_pin: &str) -> Result<()> {
        let puk = puk.to_owned();
        let new_pin = new_pin.to_owned();
        self.request(|reply| Command::UnblockPin { puk, new_pin, reply })
            .await
    }

    pub async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<()> {
        let old_pin = old_pin.to_owned();
        let new_pin = new_pin.to_owned();
        self.request(|reply| Command::ChangePin { old_pin, new_pin, reply })
            .await
    }

    pub async fn identity(&self) -> Result<DeviceIdentity> {
        let (tx, rx) = oneshot::channel();
        self.cmds
            .send(Command::Identity { reply: tx })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Tear the loop down: cancels timers and aborts driver tasks, so
    /// late RPC replies are discarded instead of touching freed state.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmds.send(make(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

fn stopped() -> ModemError {
    ModemError::Internal("capability stopped".into())
}

struct CapabilityLoop<S> {
    rpc: Arc<dyn ModemManager>,
    family: TechnologyFamily,
    store: Arc<Store>,
    apn_db: Arc<dyn ApnDatabase>,
    events: mpsc::UnboundedSender<Event>,
    statsd: S,
    cmds: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<ModemSignal>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    cancel: CancellationToken,
    modem_state_tx: watch::Sender<ModemState>,
    registration: RegistrationTracker,
    sim_lock: SimLockTracker,
    activation: ActivationTracker,
    identity: DeviceIdentity,
    selected_network: Option<String>,
    allow_roaming: bool,
    started: bool,
    resetting: bool,
    bearer: Option<BearerPath>,
    chain: Option<InflightChain>,
    pending_connect: Option<InflightConnect>,
}

impl<S: StatsdClient> CapabilityLoop<S> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(cmd) = self.cmds.recv() => self.on_command(cmd).await,
                Some(sig) = self.signals.recv() => self.on_signal(sig).await,
                Some(msg) = self.internal_rx.recv() => self.on_internal(msg).await,
                _ = sleep_until_or_forever(self.registration.drop_deadline()) => {
                    self.on_drop_timer().await
                }
                _ = sleep_until_or_forever(self.activation.watchdog_deadline()) => {
                    self.on_activation_watchdog().await
                }
                else => break,
            }
        }
        self.abort_inflight();
        debug!("capability loop stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartModem { reply } => self.start_modem(reply),
            Command::StopModem { reply } => self.stop_modem(reply),
            Command::Connect { user_apn, reply } => {
                if self.pending_connect.is_some() {
                    let _ = reply.send(Err(ModemError::AlreadyInProgress(
                        "connect".into(),
                    )));
                    return;
                }
                self.spawn_connect(user_apn, Some(reply));
            }
            Command::Disconnect { reply } => {
                let rpc = Arc::clone(&self.rpc);
                let tx = self.internal_tx.clone();
                task::spawn(async move {
                    let res = rpc.disconnect_all().await;
                    if res.is_ok() {
                        let _ = tx.send(Internal::DisconnectDone);
                    }
                    let _ = reply.send(res);
                });
            }
            Command::Reset { reply } => {
                if self.resetting {
                    let _ = reply
                        .send(Err(ModemError::AlreadyInProgress("reset".into())));
                    return;
                }
                self.resetting = true;
                let rpc = Arc::clone(&self.rpc);
                let tx = self.internal_tx.clone();
                task::spawn(async move {
                    let res = rpc.reset().await;
                    let _ = tx.send(Internal::ResetDone);
                    let _ = reply.send(res);
                });
            }
            Command::CompleteActivation { reply } => {
                if self.activation.begin_activation().await {
                    self.activation_update().await;
                    self.spawn_activation_reset();
                }
                let _ = reply.send(Ok(()));
            }
            Command::Scan { reply } => {
                self.spawn_rpc(reply, |rpc| async move { rpc.scan().await });
            }
            Command::RequirePin { pin, require, reply } => {
                self.spawn_rpc(reply, move |rpc| async move {
                    rpc.require_pin(&pin, require).await
                });
            }
            Command::EnterPin { pin, reply } => {
                self.spawn_rpc(reply, move |rpc| async move {
                    rpc.enter_pin(&pin).await
                });
            }
            Command::UnblockPin { puk, new_pin, reply } => {
                self.spawn_rpc(reply, move |rpc| async move {
                    rpc.unblock_pin(&puk, &new_pin).await
                });
            }
            Command::ChangePin { old_pin, new_pin, reply } => {
                self.spawn_rpc(reply, move |rpc| async move {
                    rpc.change_pin(&old_pin, &new_pin).await
                });
            }
            Command::Identity { reply } => {
                let _ = reply.send(self.identity.clone());
            }
        }
    }

    fn start_modem(&mut self, reply: Reply<()>) {
        if self.chain.is_some() {
            let _ = reply.send(Err(ModemError::AlreadyInProgress(
                "start or stop sequence".into(),
            )));
            return;
        }

        info!("starting modem");
        let cx = self.chain_ctx();
        let chain = match self.family {
            TechnologyFamily::Classic => classic::enable_chain(cx),
            TechnologyFamily::Universal => universal::enable_chain(cx),
        };
        let tx = self.internal_tx.clone();
        let task = task::spawn(async move {
            let _ = tx.send(Internal::StartDone(chain.run().await));
        });
        self.chain = Some(InflightChain {
            kind: ChainKind::Start,
            task,
            reply,
        });
    }

    fn stop_modem(&mut self, reply: Reply<()>) {
        if let Some(chain) = self.chain.take() {
            match chain.kind {
                ChainKind::Stop => {
                    let _ = reply.send(Err(ModemError::AlreadyInProgress(
                        "stop sequence".into(),
                    )));
                    self.chain = Some(chain);
                    return;
                }
                ChainKind::Start => {
                    // The enable chain loses; its caller learns why.
                    chain.task.abort();
                    let _ = chain.reply.send(Err(ModemError::WrongState(
                        "modem is being stopped".into(),
                    )));
                }
            }
        }

        // The service is going away, so an outstanding deferred
        // deregistration is moot.
        if self.registration.cancel_pending_drop() {
            debug!("canceled delayed deregistration for stop");
        }

        info!("stopping modem");
        let cx = self.chain_ctx();
        let chain = disable_chain(cx);
        let tx = self.internal_tx.clone();
        let task = task::spawn(async move {
            let _ = tx.send(Internal::StopDone(chain.run().await));
        });
        self.chain = Some(InflightChain {
            kind: ChainKind::Stop,
            task,
            reply,
        });
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Properties(props) => self.apply_properties(props).await,
            Internal::HardwareInfo(info) => {
                debug!(
                    manufacturer = %info.manufacturer,
                    model = %info.model,
                    "modem hardware identified"
                );
                self.identity.hardware = Some(info);
            }
            Internal::HomeProviderReset => {
                self.identity.home_operator_id = None;
                self.identity.carrier = None;
            }
            Internal::EnableDeferred => {
                self.count(stats::ENABLE_DEFERRED).await;
            }
            Internal::StartDone(res) => {
                // A start aborted by a stop may still get its completion in;
                // only the matching chain consumes it.
                let Some(chain) = self.chain.take_if(|c| c.kind == ChainKind::Start)
                else {
                    return;
                };
                if res.is_ok() {
                    self.started = true;
                    info!("modem enabled");
                    self.refresh_properties();
                }
                let _ = chain.reply.send(res);
            }
            Internal::StopDone(res) => {
                let Some(chain) = self.chain.take_if(|c| c.kind == ChainKind::Stop)
                else {
                    return;
                };
                if res.is_ok() {
                    self.started = false;
                    self.bearer = None;
                    info!("modem disabled, sessions released");
                }
                let _ = chain.reply.send(res);
            }
            Internal::ConnectDone(res) => {
                let Some(attempt) = self.pending_connect.take() else {
                    return;
                };
                match &res {
                    Ok(bearer) => {
                        info!(%bearer, "data session established");
                        self.bearer = Some(bearer.clone());
                    }
                    Err(e) => warn!("connect attempt failed: {e}"),
                }
                if let Some(reply) = attempt.reply {
                    let _ = reply.send(res);
                }
                self.activation_update().await;
            }
            Internal::DisconnectDone => {
                self.bearer = None;
            }
            Internal::ResetDone => {
                self.resetting = false;
            }
            Internal::ActivationResetDone(ok) => {
                self.resetting = false;
                if ok {
                    self.activation.on_reset_completed();
                    self.activation_update().await;
                }
            }
        }
    }

    async fn on_signal(&mut self, signal: ModemSignal) {
        match signal {
            ModemSignal::StateChanged { new, .. } => self.set_modem_state(new),
            ModemSignal::Properties(props) => self.apply_properties(props).await,
            ModemSignal::RegistrationInfo {
                state,
                operator_code,
                operator_name,
            } => {
                self.apply_registration(RegistrationUpdate {
                    state,
                    operator_code,
                    operator_name,
                })
                .await;
            }
            ModemSignal::SignalQuality(quality) => self.signal_quality(quality).await,
        }
    }

    async fn apply_properties(&mut self, props: PropertiesChanged) {
        match props {
            PropertiesChanged::Modem(p) => self.apply_modem_properties(p).await,
            PropertiesChanged::Modem3gpp(p) => {
                self.apply_modem3gpp_properties(p).await
            }
            PropertiesChanged::Sim(p) => self.apply_sim_properties(p).await,
        }
    }

    async fn apply_modem_properties(&mut self, props: ModemProperties) {
        if let Some(state) = props.state {
            self.set_modem_state(state);
        }

        if let Some(path) = props.sim_path {
            let present = !(path.is_empty() || path == "/");
            if self.identity.sim_present != present {
                info!(present, "sim presence changed");
                self.identity.sim_present = present;
                self.send_event(Event::SimPresentChanged { present });
                if present && self.sim_lock.unlocked() {
                    self.refresh_sim_properties();
                }
            }
        }

        let mut lock_changed = false;
        if let Some(lock) = props.unlock_required {
            lock_changed |= self.sim_lock.on_lock_type_changed(lock);
        }
        if let Some(retries) = props.unlock_retries {
            lock_changed |= self.sim_lock.on_lock_retries_changed(retries);
        }
        if lock_changed {
            self.lock_status_changed();
        }

        if let Some(numbers) = props.own_numbers {
            if let Some(mdn) = numbers.first() {
                self.identity.mdn = Some(mdn.clone());
                self.activation.on_mdn_changed(mdn);
                self.activation_update().await;
            }
        }

        if let Some(quality) = props.signal_quality {
            self.signal_quality(quality).await;
        }
    }

    async fn apply_modem3gpp_properties(&mut self, props: Modem3gppProperties) {
        if let Some(imei) = props.imei {
            self.identity.imei = Some(imei);
        }

        if let Some(enabled) = props.pin_enabled {
            if self.sim_lock.on_pin_enabled_changed(enabled) {
                self.lock_status_changed();
            }
        }

        if let Some(state) = props.subscription_state {
            if self.activation.on_subscription_state_changed(state) {
                self.send_event(Event::SubscriptionStateChanged {
                    state: state.into(),
                });
                self.activation_update().await;
            }
        }

        // Registration state and operator identity arrive piecemeal; treat
        // any of them as one registration change, padded with current values.
        if props.registration_state.is_some()
            || props.operator_code.is_some()
            || props.operator_name.is_some()
        {
            let update = RegistrationUpdate {
                state: props
                    .registration_state
                    .unwrap_or(self.registration.state()),
                operator_code: props
                    .operator_code
                    .unwrap_or_else(|| self.registration.operator_code().to_owned()),
                operator_name: props
                    .operator_name
                    .unwrap_or_else(|| self.registration.operator_name().to_owned()),
            };
            self.apply_registration(update).await;
        }
    }

    async fn apply_sim_properties(&mut self, props: SimProperties) {
        if let Some(iccid) = props.iccid {
            if self.identity.iccid.as_deref() != Some(iccid.as_str()) {
                debug!(iccid, "sim identifier changed");
                self.identity.iccid = Some(iccid.clone());
                self.activation.on_iccid_changed(iccid);
                self.activation_update().await;
            }
        }

        if let Some(imsi) = props.imsi {
            self.update_home_provider(&imsi);
            self.identity.imsi = Some(imsi);
        }

        if let Some(spn) = props.spn {
            self.identity.spn = Some(spn);
        }

        if let Some(msisdn) = props.msisdn {
            self.identity.mdn = Some(msisdn.clone());
            self.activation.on_mdn_changed(&msisdn);
            self.activation_update().await;
        }
    }

    async fn apply_registration(&mut self, update: RegistrationUpdate) {
        let modem_state = *self.modem_state_tx.borrow();
        match self.registration.on_registration_changed(modem_state, update) {
            DebounceDecision::Applied => self.registration_applied().await,
            DebounceDecision::DropPosted => {
                self.count(stats::REGISTRATION_DROP_POSTED).await;
            }
            DebounceDecision::DropCoalesced => {}
            DebounceDecision::DropCanceled => {
                self.count(stats::REGISTRATION_DROP_CANCELED).await;
                self.registration_applied().await;
            }
        }
    }

    async fn registration_applied(&mut self) {
        debug!(
            state = %self.registration.state(),
            operator = self.registration.operator_name(),
            "registration changed"
        );
        self.send_event(Event::RegistrationChanged {
            state: self.registration.state().into(),
            operator_code: self.registration.operator_code().to_owned(),
            operator_name: self.registration.operator_name().to_owned(),
        });
        self.activation_update().await;
    }

    async fn on_drop_timer(&mut self) {
        if self.registration.apply_pending_drop().is_some() {
            self.registration_applied().await;
        }
    }

    async fn on_activation_watchdog(&mut self) {
        self.activation.on_watchdog_fired().await;
        self.count(stats::ACTIVATION_REGISTRATION_TIMEOUT).await;
    }

    async fn activation_update(&mut self) {
        let registered = self.registration.is_registered();
        if self.activation.update(registered).await {
            self.auto_connect();
        }
    }

    fn auto_connect(&mut self) {
        if !self.started || self.pending_connect.is_some() {
            return;
        }
        let state = *self.modem_state_tx.borrow();
        if matches!(state, ModemState::Connecting | ModemState::Connected) {
            return;
        }
        info!("auto-connecting after activation");
        self.spawn_connect(None, None);
    }

    fn spawn_connect(
        &mut self,
        user_apn: Option<ApnCandidate>,
        reply: Option<Reply<BearerPath>>,
    ) {
        let mut negotiator = ApnNegotiator::builder()
            .rpc(Arc::clone(&self.rpc))
            .store(Arc::clone(&self.store))
            .db(Arc::clone(&self.apn_db))
            .maybe_iccid(self.identity.iccid.clone())
            .maybe_operator_id(self.identity.home_operator_id.clone())
            .maybe_spn(self.identity.spn.clone())
            .maybe_user_apn(user_apn)
            .allow_roaming(self.allow_roaming)
            .build();

        let tx = self.internal_tx.clone();
        let task = task::spawn(async move {
            negotiator.build_try_list();
            let res = negotiator.connect().await;
            let _ = tx.send(Internal::ConnectDone(res));
        });
        self.pending_connect = Some(InflightConnect { task, reply });
    }

    fn spawn_activation_reset(&mut self) {
        if self.resetting {
            debug!("reset already in progress, relying on the stored record");
            return;
        }
        self.resetting = true;

        let rpc = Arc::clone(&self.rpc);
        let tx = self.internal_tx.clone();
        task::spawn(async move {
            debug!("resetting modem for activation");
            match rpc.reset().await {
                Ok(()) => {
                    let _ = tx.send(Internal::ActivationResetDone(true));
                }
                Err(e) => {
                    // The stored record drives a later retry; this reset
                    // failing is not fatal.
                    debug!("failed to reset after activation: {e}");
                    let _ = tx.send(Internal::ActivationResetDone(false));
                }
            }
        });
    }

    fn spawn_rpc<T, F, Fut>(&self, reply: Reply<T>, f: F)
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn ModemManager>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let rpc = Arc::clone(&self.rpc);
        task::spawn(async move {
            let _ = reply.send(f(rpc).await);
        });
    }

    fn chain_ctx(&self) -> ChainCtx {
        let state = *self.modem_state_tx.borrow();
        ChainCtx {
            rpc: Arc::clone(&self.rpc),
            tx: self.internal_tx.clone(),
            state_rx: self.modem_state_tx.subscribe(),
            selected_network: self.selected_network.clone(),
            device_enabled: state.is_enabled(),
            device_registered: state.is_device_registered(),
        }
    }

    fn set_modem_state(&mut self, new: ModemState) {
        let old = *self.modem_state_tx.borrow();
        if old == new {
            return;
        }
        debug!(%old, %new, "modem state changed");
        self.modem_state_tx.send_replace(new);
        self.send_event(Event::ModemStateChanged {
            state: new.to_string(),
        });
    }

    fn lock_status_changed(&mut self) {
        let status = self.sim_lock.status();
        debug!(
            lock_type = %status.lock_type,
            retries = status.retries_left,
            "sim lock status changed"
        );
        self.send_event(Event::LockStatusChanged {
            enabled: status.enabled,
            lock_type: status.lock_type.into(),
            retries_left: status.retries_left,
        });

        // The SIM only becomes readable once unlocked; go fetch what it
        // refused to tell us before.
        if self.sim_lock.unlocked() && self.identity.sim_present {
            self.refresh_sim_properties();
        }
    }

    fn update_home_provider(&mut self, imsi: &str) {
        self.identity.home_operator_id = self.apn_db.operator_id_from_imsi(imsi);
        self.identity.carrier = self
            .identity
            .home_operator_id
            .as_deref()
            .and_then(|id| self.apn_db.carrier(id));
        if let Some(carrier) = &self.identity.carrier {
            info!(name = %carrier.name, country = %carrier.country, "identified home provider");
        }
    }

    fn refresh_sim_properties(&self) {
        let rpc = Arc::clone(&self.rpc);
        let tx = self.internal_tx.clone();
        task::spawn(async move {
            match rpc.get_sim_properties().await {
                Ok(props) => {
                    let _ = tx.send(Internal::Properties(PropertiesChanged::Sim(props)));
                }
                Err(e) => debug!("failed to refresh sim properties: {e}"),
            }
        });
    }

    /// Best-effort refresh of everything after a successful start.
    fn refresh_properties(&self) {
        let rpc = Arc::clone(&self.rpc);
        let tx = self.internal_tx.clone();
        task::spawn(async move {
            match rpc.get_modem_properties().await {
                Ok(props) => {
                    let _ =
                        tx.send(Internal::Properties(PropertiesChanged::Modem(props)));
                }
                Err(e) => debug!("failed to refresh modem properties: {e}"),
            }
            match rpc.get_modem3gpp_properties().await {
                Ok(props) => {
                    let _ = tx
                        .send(Internal::Properties(PropertiesChanged::Modem3gpp(props)));
                }
                Err(e) => debug!("failed to refresh network properties: {e}"),
            }
            match rpc.get_sim_properties().await {
                Ok(props) => {
                    let _ = tx.send(Internal::Properties(PropertiesChanged::Sim(props)));
                }
                Err(e) => debug!("failed to refresh sim properties: {e}"),
            }
        });
    }

    async fn signal_quality(&mut self, quality: u32) {
        self.send_event(Event::SignalQualityChanged { quality });
        if let Err(e) = self
            .statsd
            .gauge(stats::SIGNAL_QUALITY, &quality.to_string(), NO_TAGS)
            .await
        {
            debug!("failed to emit signal quality gauge: {e}");
        }
    }

    async fn count(&self, stat: &str) {
        if let Err(e) = self.statsd.count(stat, 1, NO_TAGS).await {
            debug!("failed to emit {stat}: {e}");
        }
    }

    fn send_event(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn abort_inflight(&mut self) {
        if let Some(chain) = self.chain.take() {
            chain.task.abort();
        }
        if let Some(connect) = self.pending_connect.take() {
            connect.task.abort();
        }
    }
}

fn disable_chain(cx: ChainCtx) -> StepChain {
    let mut chain = StepChain::new("disable");

    let c = cx.clone();
    chain.push("disable-modem", move || async move {
        c.rpc.enable(false).await
    });

    // The disable already succeeded by this point; a power-down failure is
    // swallowed and the stop still reports success.
    let c = cx.clone();
    chain.push_ignorable("power-down", move || async move {
        c.rpc.set_power_state(PowerState::Low).await
    });

    chain
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl From<RegistrationState> for wwand_events::Registration {
    fn from(state: RegistrationState) -> Self {
        match state {
            RegistrationState::Unknown => wwand_events::Registration::Unknown,
            RegistrationState::Idle => wwand_events::Registration::Idle,
            RegistrationState::Searching => wwand_events::Registration::Searching,
            RegistrationState::Home => wwand_events::Registration::Home,
            RegistrationState::Roaming => wwand_events::Registration::Roaming,
            RegistrationState::Denied => wwand_events::Registration::Denied,
        }
    }
}

impl From<SimLockType> for wwand_events::LockType {
    fn from(lock: SimLockType) -> Self {
        match lock {
            SimLockType::None => wwand_events::LockType::None,
            SimLockType::Unknown => wwand_events::LockType::Unknown,
            SimLockType::SimPin => wwand_events::LockType::SimPin,
            SimLockType::SimPuk => wwand_events::LockType::SimPuk,
        }
    }
}

impl From<SubscriptionState> for wwand_events::Subscription {
    fn from(state: SubscriptionState) -> Self {
        match state {
            SubscriptionState::Unknown => wwand_events::Subscription::Unknown,
            SubscriptionState::Provisioned => wwand_events::Subscription::Provisioned,
            SubscriptionState::Unprovisioned => {
                wwand_events::Subscription::Unprovisioned
            }
            SubscriptionState::OutOfData => wwand_events::Subscription::OutOfData,
        }
    }
}
