//! Post-payment carrier activation tracking.
//!
//! Some SIMs need an over-the-air activation pass: the host completes payment,
//! we persist the SIM's ICCID as pending, reset the modem, and wait for the
//! carrier to start reporting the subscription as provisioned. Progress is
//! keyed by ICCID in the durable store so it survives daemon restarts and the
//! SIM moving between modems.

use crate::store::{Store, NS_PENDING_ACTIVATION};
use derive_more::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// How long to wait for network registration after the activation reset
/// before recording that we stopped actively waiting.
pub const REGISTRATION_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Carrier-reported provisioning status.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unknown,
    Provisioned,
    Unprovisioned,
    OutOfData,
}

/// Durable per-ICCID activation progress.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationState {
    #[default]
    Unknown,
    Pending,
    Activated,
    PendingTimeout,
}

impl ActivationState {
    fn as_str(self) -> &'static str {
        match self {
            ActivationState::Unknown => "unknown",
            ActivationState::Pending => "pending",
            ActivationState::Activated => "activated",
            ActivationState::PendingTimeout => "pending-timeout",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => ActivationState::Pending,
            "activated" => ActivationState::Activated,
            "pending-timeout" => ActivationState::PendingTimeout,
            _ => ActivationState::Unknown,
        }
    }
}

/// What the host-visible service reports for this SIM.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceActivationState {
    #[default]
    NotActivated,
    Activating,
    Activated,
}

pub struct ActivationTracker {
    store: Arc<Store>,
    subscription_state: SubscriptionState,
    service_state: ServiceActivationState,
    iccid: Option<String>,
    /// Normalized to digits only.
    mdn: Option<String>,
    reset_done: bool,
    registration_timeout: Duration,
    register_deadline: Option<Instant>,
}

impl ActivationTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_registration_timeout(store, REGISTRATION_WAIT_TIMEOUT)
    }

    pub fn with_registration_timeout(store: Arc<Store>, timeout: Duration) -> Self {
        Self {
            store,
            subscription_state: SubscriptionState::Unknown,
            service_state: ServiceActivationState::NotActivated,
            iccid: None,
            mdn: None,
            reset_done: false,
            registration_timeout: timeout,
            register_deadline: None,
        }
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription_state
    }

    pub fn service_state(&self) -> ServiceActivationState {
        self.service_state
    }

    /// Returns true when the state actually changed.
    pub fn on_subscription_state_changed(&mut self, state: SubscriptionState) -> bool {
        if self.subscription_state == state {
            return false;
        }
        debug!(%state, "subscription state changed");
        self.subscription_state = state;
        true
    }

    pub fn on_iccid_changed(&mut self, iccid: String) {
        self.iccid = Some(iccid);
    }

    /// Keep only the digits; some services report punctuated numbers.
    pub fn on_mdn_changed(&mut self, raw: &str) {
        self.mdn = Some(raw.chars().filter(char::is_ascii_digit).collect());
    }

    /// The activation reset issued by [`begin_activation`] finished.
    ///
    /// [`begin_activation`]: ActivationTracker::begin_activation
    pub fn on_reset_completed(&mut self) {
        self.reset_done = true;
    }

    /// Persist the current ICCID as pending activation. Returns false when no
    /// ICCID is known yet; the caller skips the reset in that case.
    pub async fn begin_activation(&mut self) -> bool {
        let Some(iccid) = self.iccid.clone() else {
            debug!("sim identifier not available, nothing to do");
            return false;
        };

        self.reset_done = false;
        self.set_record(&iccid, ActivationState::Pending).await;
        true
    }

    /// Re-evaluate activation against the current subscription state, MDN and
    /// the persisted record. Called on every relevant signal. Returns true
    /// when the service should auto-connect now.
    pub async fn update(&mut self, registered: bool) -> bool {
        // Without the ICCID there is no record to consult; everything here
        // re-runs once it becomes known.
        let Some(iccid) = self.iccid.clone() else {
            return false;
        };

        let activated = matches!(
            self.subscription_state,
            SubscriptionState::Provisioned | SubscriptionState::OutOfData
        ) || (self.subscription_state == SubscriptionState::Unknown
            && self.mdn_valid());

        if activated {
            if self.record(&iccid) != ActivationState::Unknown {
                debug!(iccid, "subscription confirmed, clearing activation record");
                self.remove_record(&iccid).await;
            }
            self.service_state = ServiceActivationState::Activated;
            self.register_deadline = None;
            return false;
        }

        if self.service_state == ServiceActivationState::Activated {
            return false;
        }

        match self.record(&iccid) {
            ActivationState::Pending => {
                // The ICCID may have been unavailable earlier; make sure the
                // service shows as activating either way.
                self.service_state = ServiceActivationState::Activating;
                if self.reset_done {
                    debug!("post-payment activation reset complete");
                    self.set_record(&iccid, ActivationState::Activated).await;
                    self.arm_watchdog(registered);
                }
                false
            }
            ActivationState::Activated | ActivationState::PendingTimeout => {
                self.service_state = ServiceActivationState::Activating;
                if registered {
                    self.register_deadline = None;
                    debug!("registered after activation reset, triggering auto-connect");
                    true
                } else {
                    self.arm_watchdog(registered);
                    false
                }
            }
            ActivationState::Unknown => false,
        }
    }

    /// Deadline of the armed watchdog, for the owner's timer arm.
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.register_deadline
    }

    /// Resolves when the registration wait expires; pending forever while no
    /// watchdog is armed.
    pub async fn watchdog_due(&self) {
        match self.register_deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Stop actively waiting for registration: persist the record as timed
    /// out. Removal rules and later auto-connect are unaffected.
    pub async fn on_watchdog_fired(&mut self) {
        self.register_deadline = None;
        let Some(iccid) = self.iccid.clone() else {
            return;
        };
        if self.record(&iccid) == ActivationState::Activated {
            warn!(iccid, "no registration after activation reset, recording timeout");
            self.set_record(&iccid, ActivationState::PendingTimeout).await;
        }
    }

    fn arm_watchdog(&mut self, registered: bool) {
        if !registered && self.register_deadline.is_none() {
            self.register_deadline = Some(Instant::now() + self.registration_timeout);
        }
    }

    fn mdn_valid(&self) -> bool {
        match &self.mdn {
            Some(mdn) => !mdn.is_empty() && mdn.chars().any(|c| c != '0'),
            None => false,
        }
    }

    fn record(&self, iccid: &str) -> ActivationState {
        self.store
            .get(NS_PENDING_ACTIVATION, iccid)
            .map(|s| ActivationState::parse(&s))
            .unwrap_or_default()
    }

    async fn set_record(&self, iccid: &str, state: ActivationState) {
        if let Err(e) = self
            .store
            .set(NS_PENDING_ACTIVATION, iccid, state.as_str())
            .await
        {
            warn!("failed to persist activation record: {e}");
        }
    }

    async fn remove_record(&self, iccid: &str) {
        if let Err(e) = self.store.remove(NS_PENDING_ACTIVATION, iccid).await {
            warn!("failed to remove activation record: {e}");
        }
    }
}
