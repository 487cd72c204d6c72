//! Client abstraction over the external modem-management RPC service.
//!
//! The capability core talks to this trait only; the production
//! implementation lives in [`dbus`] and speaks D-Bus. Tests substitute a
//! mockall mock.

use crate::activation::SubscriptionState;
use crate::registration::RegistrationState;
use crate::sim_lock::SimLockType;
use async_trait::async_trait;
use derive_more::Display;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod dbus;

pub type Result<T> = std::result::Result<T, ModemError>;

/// Error taxonomy for modem operations. Kinds, not transport detail: the
/// D-Bus layer maps wire errors onto these, and the capability decides
/// retry/defer/abort policy from the kind alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModemError {
    /// The operation was accepted and is running; a terminal reply follows.
    #[error("operation initiated")]
    OperationInitiated,
    /// The operation is invalid for the modem's current state. May trigger a
    /// deferred retry (universal enable).
    #[error("wrong state: {0}")]
    WrongState(String),
    /// The requested APN was rejected. Retriable inside the negotiator.
    #[error("invalid apn: {0}")]
    InvalidApn(String),
    #[error("operation already in progress: {0}")]
    AlreadyInProgress(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("rpc failure: {0}")]
    Internal(String),
}

impl ModemError {
    /// Connect failures that should fall through to the next APN candidate.
    pub fn is_retriable_connect(&self) -> bool {
        matches!(self, ModemError::InvalidApn(_))
    }

    pub(crate) fn internal(e: impl std::fmt::Display) -> Self {
        ModemError::Internal(e.to_string())
    }
}

/// Coarse modem life-cycle stage as reported by the management service.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModemState {
    Failed,
    Unknown,
    Disabled,
    Initializing,
    Locked,
    Disabling,
    Enabling,
    Enabled,
    Searching,
    Registered,
    Disconnecting,
    Connecting,
    Connected,
}

impl ModemState {
    /// The device-side radio has been powered up.
    pub fn is_enabled(self) -> bool {
        self >= ModemState::Enabled
    }

    /// The modem has progressed at least to network search, i.e. the classic
    /// enable chain may skip its explicit Register step.
    pub fn is_device_registered(self) -> bool {
        self >= ModemState::Searching
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Low,
    Off,
}

/// Which protocol generation the modem speaks; decides the capability
/// variant at construction time.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TechnologyFamily {
    /// Older single-generation firmware driven by per-field polls.
    Classic,
    /// Modern 3GPP firmware pushing state through property notifications.
    Universal,
}

/// Path of an established data bearer on the management service.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub struct BearerPath(pub String);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectProperties {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_method: Option<ApnAuthMethod>,
    pub allow_roaming: bool,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApnAuthMethod {
    Pap,
    Chap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemHardwareInfo {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub operator_code: String,
    pub operator_name: String,
    pub status: ScanStatus,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Unknown,
    Available,
    Current,
    Forbidden,
}

/// Partial update of the Modem interface; `None` means "unchanged".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModemProperties {
    pub state: Option<ModemState>,
    /// Object path of the active SIM; "/" or empty means no SIM.
    pub sim_path: Option<String>,
    pub unlock_required: Option<SimLockType>,
    pub unlock_retries: Option<HashMap<SimLockType, u32>>,
    /// Numbers assigned to the device; the first entry is the MDN.
    pub own_numbers: Option<Vec<String>>,
    /// Percentage, 0-100.
    pub signal_quality: Option<u32>,
}

/// Partial update of the 3GPP/network interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modem3gppProperties {
    pub imei: Option<String>,
    pub registration_state: Option<RegistrationState>,
    pub operator_code: Option<String>,
    pub operator_name: Option<String>,
    pub subscription_state: Option<SubscriptionState>,
    /// Whether the SIM-PIN facility lock is switched on.
    pub pin_enabled: Option<bool>,
}

/// Partial update of the Sim interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimProperties {
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub spn: Option<String>,
    /// The subscriber number (MDN) as stored on the SIM.
    pub msisdn: Option<String>,
}

/// One property-changed notification, multiplexed by interface.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertiesChanged {
    Modem(ModemProperties),
    Modem3gpp(Modem3gppProperties),
    Sim(SimProperties),
}

/// Asynchronous notifications pushed by the management service.
#[derive(Debug, Clone, PartialEq)]
pub enum ModemSignal {
    StateChanged {
        old: ModemState,
        new: ModemState,
    },
    Properties(PropertiesChanged),
    /// Classic-network registration signal carrying the full tuple.
    RegistrationInfo {
        state: RegistrationState,
        operator_code: String,
        operator_name: String,
    },
    SignalQuality(u32),
}

/// Fixed per-operation RPC timeouts.
pub mod timeouts {
    use std::time::Duration;

    pub const DEFAULT: Duration = Duration::from_secs(5);
    pub const ENABLE: Duration = Duration::from_secs(45);
    pub const CONNECT: Duration = Duration::from_secs(45);
    pub const DISCONNECT: Duration = Duration::from_secs(45);
    pub const REGISTER: Duration = Duration::from_secs(90);
    pub const SCAN: Duration = Duration::from_secs(120);
    pub const RESET: Duration = Duration::from_secs(90);
    pub const ENTER_PIN: Duration = Duration::from_secs(20);
}

/// The modem-management service, one instance per modem object.
///
/// All calls are asynchronous and complete with a typed [`ModemError`];
/// implementations apply the [`timeouts`] before resolving.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModemManager: Send + Sync + 'static {
    async fn enable(&self, enable: bool) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    async fn set_power_state(&self, state: PowerState) -> Result<()>;

    /// Register on the given operator; empty means automatic selection.
    async fn register(&self, operator_code: &str) -> Result<()>;

    async fn scan(&self) -> Result<Vec<ScanResult>>;

    async fn connect(&self, props: ConnectProperties) -> Result<BearerPath>;

    /// Tear down every active bearer.
    async fn disconnect_all(&self) -> Result<()>;

    async fn get_imei(&self) -> Result<String>;

    async fn get_imsi(&self) -> Result<String>;

    async fn get_spn(&self) -> Result<String>;

    async fn get_msisdn(&self) -> Result<String>;

    async fn get_modem_info(&self) -> Result<ModemHardwareInfo>;

    async fn get_modem_properties(&self) -> Result<ModemProperties>;

    async fn get_modem3gpp_properties(&self) -> Result<Modem3gppProperties>;

    async fn get_sim_properties(&self) -> Result<SimProperties>;

    async fn require_pin(&self, pin: &str, require: bool) -> Result<()>;

    async fn enter_pin(&self, pin: &str) -> Result<()>;

    async fn unblock_pin(&self, puk: &str, new_pin: &str) -> Result<()>;

    async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<()>;
}
