//! Enable sequence for the universal (3GPP) protocol variant.
//!
//! Modern firmware pushes identity and registration data through property
//! notifications, so the chain is short: power up, then prime the property
//! caches once.

use super::{ChainCtx, Internal};
use crate::modem_manager::{ModemError, ModemState, PropertiesChanged};
use crate::step_chain::StepChain;
use tracing::info;

pub(super) fn enable_chain(cx: ChainCtx) -> StepChain {
    let mut chain = StepChain::new("enable-universal");

    let c = cx.clone();
    chain.push("enable-modem", move || async move {
        match c.rpc.enable(true).await {
            // Most commonly the SIM is locked and the modem refuses to come
            // up. Hold the request until the modem reports Disabled (the
            // user supplied the PIN) and re-issue it, non-deferrable.
            Err(ModemError::WrongState(reason)) => {
                info!("deferring enable, modem in wrong state: {reason}");
                c.send(Internal::EnableDeferred);

                let mut state_rx = c.state_rx.clone();
                state_rx
                    .wait_for(|s| *s == ModemState::Disabled)
                    .await
                    .map_err(|_| {
                        ModemError::Internal("modem state feed closed".into())
                    })?;

                info!("enabling modem after deferring");
                c.rpc.enable(true).await
            }
            other => other,
        }
    });

    let c = cx.clone();
    chain.push("get-properties", move || async move {
        let modem = c.rpc.get_modem_properties().await?;
        c.send(Internal::Properties(PropertiesChanged::Modem(modem)));
        let network = c.rpc.get_modem3gpp_properties().await?;
        c.send(Internal::Properties(PropertiesChanged::Modem3gpp(network)));
        Ok(())
    });

    chain
}
