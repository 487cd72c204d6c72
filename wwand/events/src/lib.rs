use serde::{Deserialize, Serialize};

/// Notifications the capability raises towards the host device layer.
///
/// These are wire-stable payloads: the host forwards them to its own external
/// API, so additions are fine but renames are breaking.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Event {
    RegistrationChanged {
        state: Registration,
        operator_code: String,
        operator_name: String,
    },
    SignalQualityChanged {
        /// Percentage, 0-100.
        quality: u32,
    },
    LockStatusChanged {
        enabled: bool,
        lock_type: LockType,
        retries_left: u32,
    },
    SubscriptionStateChanged {
        state: Subscription,
    },
    SimPresentChanged {
        present: bool,
    },
    ModemStateChanged {
        state: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unknown,
    Idle,
    Searching,
    /// Registered on the home network.
    Home,
    /// Registered on a visited network.
    Roaming,
    Denied,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    None,
    Unknown,
    SimPin,
    SimPuk,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Unknown,
    Provisioned,
    Unprovisioned,
    OutOfData,
}
