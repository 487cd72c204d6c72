//! Network-registration state machine with drop debouncing.
//!
//! While a data session is up, modems occasionally report a brief
//! deregistration that heals on its own. Applying those immediately would
//! tear the service down for nothing, so drops observed while Connected are
//! held back for a fixed window and only applied if nothing better arrives.

use crate::modem_manager::ModemState;
use derive_more::Display;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// How long a registration drop is held back while the modem is connected.
pub const DROP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unknown,
    Idle,
    Searching,
    Home,
    Roaming,
    Denied,
}

impl RegistrationState {
    /// Home and Roaming jointly count as registered.
    pub fn is_registered(self) -> bool {
        matches!(self, RegistrationState::Home | RegistrationState::Roaming)
    }
}

/// One registration-changed notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationUpdate {
    pub state: RegistrationState,
    pub operator_code: String,
    pub operator_name: String,
}

/// What [`RegistrationTracker::on_registration_changed`] did with the
/// notification. `Applied` and `DropCanceled` mean the tracker state changed
/// right away; the two drop outcomes mean a timer now holds the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    Applied,
    DropPosted,
    DropCoalesced,
    DropCanceled,
}

#[derive(Debug)]
struct PendingDrop {
    deadline: Instant,
    update: RegistrationUpdate,
}

#[derive(Debug)]
pub struct RegistrationTracker {
    state: RegistrationState,
    operator_code: String,
    operator_name: String,
    drop_timeout: Duration,
    pending_drop: Option<PendingDrop>,
}

impl Default for RegistrationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::with_drop_timeout(DROP_TIMEOUT)
    }

    pub fn with_drop_timeout(drop_timeout: Duration) -> Self {
        Self {
            state: RegistrationState::Unknown,
            operator_code: String::new(),
            operator_name: String::new(),
            drop_timeout,
            pending_drop: None,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state.is_registered()
    }

    pub fn operator_code(&self) -> &str {
        &self.operator_code
    }

    pub fn operator_name(&self) -> &str {
        &self.operator_name
    }

    /// Feed one registration-changed notification through the debounce rule.
    ///
    /// A drop (non-registered update while the modem is Connected and the
    /// tracker Registered) is deferred: the latest payload replaces any
    /// pending one and the window restarts. Anything else cancels a pending
    /// drop and applies immediately.
    pub fn on_registration_changed(
        &mut self,
        modem_state: ModemState,
        update: RegistrationUpdate,
    ) -> DebounceDecision {
        let is_drop = modem_state == ModemState::Connected
            && self.is_registered()
            && !update.state.is_registered();

        if is_drop {
            let coalesced = self.pending_drop.is_some();
            if coalesced {
                warn!("consecutive registration drops reported, restarting debounce window");
            }
            self.pending_drop = Some(PendingDrop {
                deadline: Instant::now() + self.drop_timeout,
                update,
            });
            debug!("posted deferred registration state update");
            if coalesced {
                DebounceDecision::DropCoalesced
            } else {
                DebounceDecision::DropPosted
            }
        } else {
            let canceled = self.cancel_pending_drop();
            self.apply(update);
            if canceled {
                debug!("canceled a deferred registration state update");
                DebounceDecision::DropCanceled
            } else {
                DebounceDecision::Applied
            }
        }
    }

    /// Resolves when the pending drop window elapses; pending forever while
    /// no drop is held. Intended for a `select!` arm in the owner's loop.
    pub async fn drop_due(&self) {
        match &self.pending_drop {
            Some(pending) => time::sleep_until(pending.deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Apply the held drop as if it had just arrived undebounced. Returns the
    /// applied update, or `None` when no drop was pending (late timer wakeups
    /// are no-ops).
    pub fn apply_pending_drop(&mut self) -> Option<RegistrationUpdate> {
        let pending = self.pending_drop.take()?;
        debug!("applying deferred registration drop");
        self.apply(pending.update.clone());
        Some(pending.update)
    }

    /// Deadline of the held drop, for the owner's timer arm.
    pub fn drop_deadline(&self) -> Option<Instant> {
        self.pending_drop.as_ref().map(|p| p.deadline)
    }

    /// Idempotent; safe to call after the window already elapsed.
    pub fn cancel_pending_drop(&mut self) -> bool {
        self.pending_drop.take().is_some()
    }

    pub fn has_pending_drop(&self) -> bool {
        self.pending_drop.is_some()
    }

    fn apply(&mut self, update: RegistrationUpdate) {
        self.state = update.state;
        self.operator_code = update.operator_code;
        self.operator_name = update.operator_name;
    }
}
