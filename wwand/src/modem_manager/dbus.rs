//! D-Bus implementation of [`ModemManager`].
//!
//! The external modem-management service exposes one object per modem plus a
//! SIM object, each with a handful of interfaces. Method calls go through
//! slim generated proxies; property reads and change notifications go through
//! the standard properties interface so one parser serves both the initial
//! fetch and the signal stream.

use super::{
    timeouts, ApnAuthMethod, BearerPath, ConnectProperties, Modem3gppProperties,
    ModemError, ModemHardwareInfo, ModemManager, ModemProperties, ModemSignal,
    ModemState, PowerState, PropertiesChanged, Result, ScanResult, ScanStatus,
    SimProperties, TechnologyFamily,
};
use crate::registration::RegistrationState;
use crate::sim_lock::SimLockType;
use async_trait::async_trait;
use color_eyre::eyre::WrapErr as _;
use futures::StreamExt as _;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tracing::{debug, warn};
use zbus::fdo;
use zbus::names::InterfaceName;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

const SERVICE: &str = "org.freedesktop.ModemManager1";
const IF_MODEM: &str = "org.freedesktop.ModemManager1.Modem";
const IF_MODEM3GPP: &str = "org.freedesktop.ModemManager1.Modem.Modem3gpp";
const IF_SIMPLE: &str = "org.freedesktop.ModemManager1.Modem.Simple";
const IF_SIM: &str = "org.freedesktop.ModemManager1.Sim";
const IF_GSM_NETWORK: &str = "org.freedesktop.ModemManager1.Modem.Gsm.Network";

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem",
    assume_defaults = false
)]
trait ModemIface {
    fn enable(&self, enable: bool) -> zbus::Result<()>;
    fn reset(&self) -> zbus::Result<()>;
    fn set_power_state(&self, state: u32) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem",
    assume_defaults = false
)]
trait ModemIfaceSignals {
    #[zbus(signal)]
    fn state_changed(&self, old: i32, new: i32, reason: u32) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Modem3gpp",
    assume_defaults = false
)]
trait Modem3gppIface {
    fn register(&self, operator_id: &str) -> zbus::Result<()>;
    fn scan(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;
}

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Simple",
    assume_defaults = false
)]
trait SimpleIface {
    fn connect(
        &self,
        properties: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;
    fn disconnect(&self, bearer: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Sim",
    assume_defaults = false
)]
trait SimIface {
    fn send_pin(&self, pin: &str) -> zbus::Result<()>;
    fn send_puk(&self, puk: &str, pin: &str) -> zbus::Result<()>;
    fn enable_pin(&self, pin: &str, enabled: bool) -> zbus::Result<()>;
    fn change_pin(&self, old_pin: &str, new_pin: &str) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Gsm.Network",
    assume_defaults = false
)]
trait GsmNetworkIfaceSignals {
    #[zbus(signal)]
    fn registration_info(
        &self,
        status: u32,
        operator_code: String,
        operator_name: String,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn signal_quality(&self, quality: u32) -> zbus::Result<()>;
}

pub struct ModemManagerDbus {
    modem: ModemIfaceProxy<'static>,
    modem_signals: ModemIfaceSignalsProxy<'static>,
    modem3gpp: Modem3gppIfaceProxy<'static>,
    simple: SimpleIfaceProxy<'static>,
    sim: SimIfaceProxy<'static>,
    gsm_network: GsmNetworkIfaceSignalsProxy<'static>,
    modem_props: fdo::PropertiesProxy<'static>,
    sim_props: fdo::PropertiesProxy<'static>,
}

impl ModemManagerDbus {
    pub async fn new(
        connection: &zbus::Connection,
        modem_path: OwnedObjectPath,
    ) -> color_eyre::Result<Self> {
        let modem_props = fdo::PropertiesProxy::builder(connection)
            .destination(SERVICE)?
            .path(modem_path.clone())?
            .build()
            .await?;

        // The SIM lives at its own object path, advertised by the modem.
        let sim_value = modem_props
            .get(InterfaceName::try_from(IF_MODEM)?, "Sim")
            .await
            .wrap_err("modem does not advertise a sim object")?;
        let sim_path = OwnedObjectPath::try_from(sim_value)
            .wrap_err("sim property is not an object path")?;

        let sim_props = fdo::PropertiesProxy::builder(connection)
            .destination(SERVICE)?
            .path(sim_path.clone())?
            .build()
            .await?;

        macro_rules! proxy {
            ($kind:ident, $path:expr) => {
                $kind::builder(connection)
                    .destination(SERVICE)?
                    .path($path.clone())?
                    .build()
                    .await?
            };
        }

        Ok(Self {
            modem: proxy!(ModemIfaceProxy, modem_path),
            modem_signals: proxy!(ModemIfaceSignalsProxy, modem_path),
            modem3gpp: proxy!(Modem3gppIfaceProxy, modem_path),
            simple: proxy!(SimpleIfaceProxy, modem_path),
            sim: proxy!(SimIfaceProxy, sim_path),
            gsm_network: proxy!(GsmNetworkIfaceSignalsProxy, modem_path),
            modem_props,
            sim_props,
        })
    }

    /// Which capability variant to construct for this modem.
    pub async fn technology_family(&self) -> Result<TechnologyFamily> {
        let value = self
            .call(
                timeouts::DEFAULT,
                self.get_prop(IF_MODEM, "CurrentCapabilities"),
            )
            .await?;
        let caps = u32::try_from(value).unwrap_or(0);

        // Bit 3 is LTE; anything carrying it speaks the universal protocol.
        Ok(if caps & 0x8 != 0 {
            TechnologyFamily::Universal
        } else {
            TechnologyFamily::Classic
        })
    }

    /// Subscribe to the service's notifications and forward them, typed,
    /// onto one channel the capability loop consumes.
    pub async fn spawn_signals(
        &self,
    ) -> color_eyre::Result<(mpsc::UnboundedReceiver<ModemSignal>, Vec<JoinHandle<()>>)>
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let mut state_changes = self.modem_signals.receive_state_changed().await?;
        let state_tx = tx.clone();
        tasks.push(task::spawn(async move {
            while let Some(signal) = state_changes.next().await {
                let Ok(args) = signal.args() else { continue };
                let msg = ModemSignal::StateChanged {
                    old: modem_state_from_mm(args.old),
                    new: modem_state_from_mm(args.new),
                };
                if state_tx.send(msg).is_err() {
                    break;
                }
            }
        }));

        let mut registrations = self.gsm_network.receive_registration_info().await?;
        let reg_tx = tx.clone();
        tasks.push(task::spawn(async move {
            while let Some(signal) = registrations.next().await {
                let Ok(args) = signal.args() else { continue };
                let msg = ModemSignal::RegistrationInfo {
                    state: registration_state_from_mm(args.status),
                    operator_code: args.operator_code,
                    operator_name: args.operator_name,
                };
                if reg_tx.send(msg).is_err() {
                    break;
                }
            }
        }));

        let mut qualities = self.gsm_network.receive_signal_quality().await?;
        let quality_tx = tx.clone();
        tasks.push(task::spawn(async move {
            while let Some(signal) = qualities.next().await {
                let Ok(args) = signal.args() else { continue };
                if quality_tx
                    .send(ModemSignal::SignalQuality(args.quality))
                    .is_err()
                {
                    break;
                }
            }
        }));

        for props in [&self.modem_props, &self.sim_props] {
            let mut changes = props.receive_properties_changed().await?;
            let prop_tx = tx.clone();
            tasks.push(task::spawn(async move {
                while let Some(signal) = changes.next().await {
                    let Ok(args) = signal.args() else { continue };
                    let changed: HashMap<String, OwnedValue> = args
                        .changed_properties
                        .iter()
                        .filter_map(|(k, v)| {
                            Some((k.to_string(), v.try_to_owned().ok()?))
                        })
                        .collect();

                    let update = match args.interface_name.as_str() {
                        IF_MODEM => Some(PropertiesChanged::Modem(
                            parse_modem_properties(&changed),
                        )),
                        IF_MODEM3GPP => Some(PropertiesChanged::Modem3gpp(
                            parse_modem3gpp_properties(&changed),
                        )),
                        IF_SIM => Some(PropertiesChanged::Sim(parse_sim_properties(
                            &changed,
                        ))),
                        IF_SIMPLE | IF_GSM_NETWORK => None,
                        other => {
                            debug!(interface = other, "ignoring property change");
                            None
                        }
                    };

                    if let Some(update) = update {
                        if prop_tx.send(ModemSignal::Properties(update)).is_err() {
                            break;
                        }
                    }
                }
            }));
        }

        Ok((rx, tasks))
    }

    async fn call<T>(
        &self,
        timeout: Duration,
        fut: impl Future<Output = zbus::Result<T>>,
    ) -> Result<T> {
        match time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_zbus_error(e)),
            Err(_) => Err(ModemError::Timeout(timeout)),
        }
    }

    async fn get_all(&self, interface: &str) -> zbus::Result<HashMap<String, OwnedValue>> {
        let props = if interface == IF_SIM {
            &self.sim_props
        } else {
            &self.modem_props
        };
        Ok(props
            .get_all(Some(InterfaceName::try_from(interface).map_err(zbus::Error::from)?).into())
            .await?)
    }

    async fn get_prop(&self, interface: &str, name: &str) -> zbus::Result<OwnedValue> {
        let props = if interface == IF_SIM {
            &self.sim_props
        } else {
            &self.modem_props
        };
        Ok(props
            .get(
                InterfaceName::try_from(interface).map_err(zbus::Error::from)?,
                name,
            )
            .await?)
    }
}

#[async_trait]
impl ModemManager for ModemManagerDbus {
    async fn enable(&self, enable: bool) -> Result<()> {
        self.call(timeouts::ENABLE, self.modem.enable(enable)).await
    }

    async fn reset(&self) -> Result<()> {
        self.call(timeouts::RESET, self.modem.reset()).await
    }

    async fn set_power_state(&self, state: PowerState) -> Result<()> {
        let state = match state {
            PowerState::Off => 1,
            PowerState::Low => 2,
            PowerState::On => 3,
        };
        self.call(timeouts::DEFAULT, self.modem.set_power_state(state))
            .await
    }

    async fn register(&self, operator_code: &str) -> Result<()> {
        self.call(timeouts::REGISTER, self.modem3gpp.register(operator_code))
            .await
    }

    async fn scan(&self) -> Result<Vec<ScanResult>> {
        let found = self.call(timeouts::SCAN, self.modem3gpp.scan()).await?;
        Ok(found.iter().map(parse_scan_result).collect())
    }

    async fn connect(&self, props: ConnectProperties) -> Result<BearerPath> {
        let mut map: HashMap<&str, Value<'_>> = HashMap::new();
        if let Some(apn) = &props.apn {
            map.insert("apn", Value::from(apn.as_str()));
        }
        if let Some(user) = &props.username {
            map.insert("user", Value::from(user.as_str()));
        }
        if let Some(password) = &props.password {
            map.insert("password", Value::from(password.as_str()));
        }
        if let Some(auth) = props.auth_method {
            let allowed: u32 = match auth {
                ApnAuthMethod::Pap => 0x2,
                ApnAuthMethod::Chap => 0x4,
            };
            map.insert("allowed-auth", Value::from(allowed));
        }
        map.insert("allow-roaming", Value::from(props.allow_roaming));

        let bearer = self
            .call(timeouts::CONNECT, self.simple.connect(map))
            .await?;
        Ok(BearerPath(bearer.to_string()))
    }

    async fn disconnect_all(&self) -> Result<()> {
        // "/" asks the service to tear down every bearer on this modem.
        let root = ObjectPath::from_static_str_unchecked("/");
        self.call(timeouts::DISCONNECT, self.simple.disconnect(&root))
            .await
    }

    async fn get_imei(&self) -> Result<String> {
        let value = self
            .call(timeouts::DEFAULT, self.get_prop(IF_MODEM3GPP, "Imei"))
            .await?;
        string_value(value).ok_or_else(|| ModemError::NotFound("imei".into()))
    }

    async fn get_imsi(&self) -> Result<String> {
        let value = self
            .call(timeouts::DEFAULT, self.get_prop(IF_SIM, "Imsi"))
            .await?;
        string_value(value).ok_or_else(|| ModemError::NotFound("imsi".into()))
    }

    async fn get_spn(&self) -> Result<String> {
        let value = self
            .call(timeouts::DEFAULT, self.get_prop(IF_SIM, "OperatorName"))
            .await?;
        string_value(value).ok_or_else(|| ModemError::NotFound("spn".into()))
    }

    async fn get_msisdn(&self) -> Result<String> {
        let value = self
            .call(timeouts::DEFAULT, self.get_prop(IF_MODEM, "OwnNumbers"))
            .await?;
        Vec::<String>::try_from(value)
            .ok()
            .and_then(|numbers| numbers.into_iter().next())
            .ok_or_else(|| ModemError::NotFound("msisdn".into()))
    }

    async fn get_modem_info(&self) -> Result<ModemHardwareInfo> {
        let map = self
            .call(timeouts::DEFAULT, self.get_all(IF_MODEM))
            .await?;
        Ok(ModemHardwareInfo {
            manufacturer: prop_string(&map, "Manufacturer").unwrap_or_default(),
            model: prop_string(&map, "Model").unwrap_or_default(),
            revision: prop_string(&map, "Revision").unwrap_or_default(),
        })
    }

    async fn get_modem_properties(&self) -> Result<ModemProperties> {
        let map = self
            .call(timeouts::DEFAULT, self.get_all(IF_MODEM))
            .await?;
        Ok(parse_modem_properties(&map))
    }

    async fn get_modem3gpp_properties(&self) -> Result<Modem3gppProperties> {
        let map = self
            .call(timeouts::DEFAULT, self.get_all(IF_MODEM3GPP))
            .await?;
        Ok(parse_modem3gpp_properties(&map))
    }

    async fn get_sim_properties(&self) -> Result<SimProperties> {
        let map = self.call(timeouts::DEFAULT, self.get_all(IF_SIM)).await?;
        Ok(parse_sim_properties(&map))
    }

    async fn require_pin(&self, pin: &str, require: bool) -> Result<()> {
        self.call(timeouts::ENTER_PIN, self.sim.enable_pin(pin, require))
            .await
    }

    async fn enter_pin(&self, pin: &str) -> Result<()> {
        self.call(timeouts::ENTER_PIN, self.sim.send_pin(pin)).await
    }

    async fn unblock_pin(&self, puk: &str, new_pin: &str) -> Result<()> {
        self.call(timeouts::ENTER_PIN, self.sim.send_puk(puk, new_pin))
            .await
    }

    async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<()> {
        self.call(timeouts::ENTER_PIN, self.sim.change_pin(old_pin, new_pin))
            .await
    }
}

fn map_zbus_error(e: zbus::Error) -> ModemError {
    if let zbus::Error::MethodError(name, message, _) = &e {
        let message = message.clone().unwrap_or_default();
        return match name.as_str() {
            "org.freedesktop.ModemManager1.Error.Core.WrongState" => {
                ModemError::WrongState(message)
            }
            "org.freedesktop.ModemManager1.Error.Core.InProgress" => {
                ModemError::AlreadyInProgress(message)
            }
            "org.freedesktop.ModemManager1.Error.MobileEquipment.MissingOrUnknownApn"
            | "org.freedesktop.ModemManager1.Error.MobileEquipment.GprsMissingOrUnknownApn" => {
                ModemError::InvalidApn(message)
            }
            "org.freedesktop.ModemManager1.Error.Core.NotFound" => {
                ModemError::NotFound(message)
            }
            "org.freedesktop.ModemManager1.Error.Core.Unsupported" => {
                ModemError::NotSupported(message)
            }
            other => {
                warn!(error = other, "unmapped rpc error");
                ModemError::Internal(format!("{other}: {message}"))
            }
        };
    }
    ModemError::internal(e)
}

fn modem_state_from_mm(state: i32) -> ModemState {
    match state {
        -1 => ModemState::Failed,
        1 => ModemState::Initializing,
        2 => ModemState::Locked,
        3 => ModemState::Disabled,
        4 => ModemState::Disabling,
        5 => ModemState::Enabling,
        6 => ModemState::Enabled,
        7 => ModemState::Searching,
        8 => ModemState::Registered,
        9 => ModemState::Disconnecting,
        10 => ModemState::Connecting,
        11 => ModemState::Connected,
        _ => ModemState::Unknown,
    }
}

fn registration_state_from_mm(state: u32) -> RegistrationState {
    match state {
        0 => RegistrationState::Idle,
        1 => RegistrationState::Home,
        2 => RegistrationState::Searching,
        3 => RegistrationState::Denied,
        5 => RegistrationState::Roaming,
        _ => RegistrationState::Unknown,
    }
}

fn sim_lock_from_mm(lock: u32) -> SimLockType {
    match lock {
        1 => SimLockType::None,
        2 | 3 => SimLockType::SimPin,
        4 | 5 => SimLockType::SimPuk,
        _ => SimLockType::Unknown,
    }
}

fn parse_modem_properties(map: &HashMap<String, OwnedValue>) -> ModemProperties {
    ModemProperties {
        state: prop_i32(map, "State").map(modem_state_from_mm),
        sim_path: prop_object_path(map, "Sim"),
        unlock_required: prop_u32(map, "UnlockRequired").map(sim_lock_from_mm),
        unlock_retries: prop_retries(map, "UnlockRetries"),
        own_numbers: prop_string_vec(map, "OwnNumbers"),
        signal_quality: prop_signal_quality(map, "SignalQuality"),
    }
}

fn parse_modem3gpp_properties(map: &HashMap<String, OwnedValue>) -> Modem3gppProperties {
    Modem3gppProperties {
        imei: prop_string(map, "Imei"),
        registration_state: prop_u32(map, "RegistrationState")
            .map(registration_state_from_mm),
        operator_code: prop_string(map, "OperatorCode"),
        operator_name: prop_string(map, "OperatorName"),
        // Carrier provisioning arrives in vendor PCO blobs; decoding those is
        // firmware-specific and left to the MDN fallback when absent.
        subscription_state: None,
        pin_enabled: prop_u32(map, "EnabledFacilityLocks").map(|locks| locks & 0x1 != 0),
    }
}

fn parse_sim_properties(map: &HashMap<String, OwnedValue>) -> SimProperties {
    SimProperties {
        iccid: prop_string(map, "SimIdentifier"),
        imsi: prop_string(map, "Imsi"),
        spn: prop_string(map, "OperatorName"),
        msisdn: prop_string(map, "Msisdn"),
    }
}

fn parse_scan_result(map: &HashMap<String, OwnedValue>) -> ScanResult {
    let status = match prop_u32(map, "status") {
        Some(1) => ScanStatus::Available,
        Some(2) => ScanStatus::Current,
        Some(3) => ScanStatus::Forbidden,
        _ => ScanStatus::Unknown,
    };
    ScanResult {
        operator_code: prop_string(map, "operator-code").unwrap_or_default(),
        operator_name: prop_string(map, "operator-long")
            .or_else(|| prop_string(map, "operator-short"))
            .unwrap_or_default(),
        status,
    }
}

fn string_value(value: OwnedValue) -> Option<String> {
    String::try_from(value).ok().filter(|s| !s.is_empty())
}

fn prop_string(map: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|v| String::try_from(v.try_clone().ok()?).ok())
        .filter(|s| !s.is_empty())
}

fn prop_u32(map: &HashMap<String, OwnedValue>, key: &str) -> Option<u32> {
    map.get(key).and_then(|v| u32::try_from(v.clone()).ok())
}

fn prop_i32(map: &HashMap<String, OwnedValue>, key: &str) -> Option<i32> {
    map.get(key).and_then(|v| i32::try_from(v.clone()).ok())
}

fn prop_object_path(map: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|v| OwnedObjectPath::try_from(v.try_clone().ok()?).ok())
        .map(|p| p.to_string())
}

fn prop_string_vec(map: &HashMap<String, OwnedValue>, key: &str) -> Option<Vec<String>> {
    map.get(key).and_then(|v| Vec::<String>::try_from(v.try_clone().ok()?).ok())
}

fn prop_retries(
    map: &HashMap<String, OwnedValue>,
    key: &str,
) -> Option<HashMap<SimLockType, u32>> {
    let raw: HashMap<u32, u32> = map
        .get(key)
        .and_then(|v| HashMap::<u32, u32>::try_from(v.try_clone().ok()?).ok())?;
    Some(
        raw.into_iter()
            .map(|(lock, count)| (sim_lock_from_mm(lock), count))
            .collect(),
    )
}

fn prop_signal_quality(map: &HashMap<String, OwnedValue>, key: &str) -> Option<u32> {
    // Reported as (quality: u32, recent: bool).
    let value = map.get(key)?;
    if let Value::Structure(fields) = &**value {
        if let Some(Value::U32(quality)) = fields.fields().first() {
            return Some(*quality);
        }
    }
    None
}
