//! Enable sequence for the classic protocol variant.
//!
//! Older firmware exposes no property push for identity data, so the enable
//! chain polls every field explicitly after powering the radio up.

use super::{ChainCtx, Internal};
use crate::modem_manager::{
    Modem3gppProperties, PropertiesChanged, SimProperties,
};
use crate::step_chain::StepChain;
use std::time::Duration;
use tokio::time;
use tracing::debug;

pub const GET_IMSI_RETRY_LIMIT: u32 = 40;
pub const GET_IMSI_RETRY_DELAY: Duration = Duration::from_millis(500);

pub(super) fn enable_chain(cx: ChainCtx) -> StepChain {
    let mut chain = StepChain::new("enable-classic");

    if !cx.device_enabled {
        let c = cx.clone();
        chain.push("enable-modem", move || async move {
            c.rpc.enable(true).await
        });
    }

    // Within range of the home network the modem registers by itself once
    // enabled; an explicit Register is only needed for a manually selected
    // operator.
    if !cx.device_registered {
        if let Some(network) = cx.selected_network.clone() {
            let c = cx.clone();
            chain.push("register", move || async move {
                c.rpc.register(&network).await
            });
        }
    }

    let c = cx.clone();
    chain.push("get-imei", move || async move {
        let imei = c.rpc.get_imei().await?;
        c.send(Internal::Properties(PropertiesChanged::Modem3gpp(
            Modem3gppProperties {
                imei: Some(imei),
                ..Default::default()
            },
        )));
        Ok(())
    });

    let c = cx.clone();
    chain.push("get-imsi", move || async move {
        let mut failures = 0;
        loop {
            match c.rpc.get_imsi().await {
                Ok(imsi) => {
                    c.send(Internal::Properties(PropertiesChanged::Sim(
                        SimProperties {
                            imsi: Some(imsi),
                            ..Default::default()
                        },
                    )));
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    if failures >= GET_IMSI_RETRY_LIMIT {
                        // Whatever home provider we guessed at is stale now.
                        c.send(Internal::HomeProviderReset);
                        return Err(e);
                    }
                    debug!(attempt = failures, "imsi retrieval failed, retrying: {e}");
                    time::sleep(GET_IMSI_RETRY_DELAY).await;
                }
            }
        }
    });

    let c = cx.clone();
    chain.push_ignorable("get-spn", move || async move {
        let spn = c.rpc.get_spn().await?;
        c.send(Internal::Properties(PropertiesChanged::Sim(SimProperties {
            spn: Some(spn),
            ..Default::default()
        })));
        Ok(())
    });

    let c = cx.clone();
    chain.push_ignorable("get-msisdn", move || async move {
        let msisdn = c.rpc.get_msisdn().await?;
        c.send(Internal::Properties(PropertiesChanged::Sim(SimProperties {
            msisdn: Some(msisdn),
            ..Default::default()
        })));
        Ok(())
    });

    let c = cx.clone();
    chain.push("get-properties", move || async move {
        let modem = c.rpc.get_modem_properties().await?;
        c.send(Internal::Properties(PropertiesChanged::Modem(modem)));
        let network = c.rpc.get_modem3gpp_properties().await?;
        c.send(Internal::Properties(PropertiesChanged::Modem3gpp(network)));
        Ok(())
    });

    let c = cx.clone();
    chain.push_ignorable("get-modem-info", move || async move {
        let info = c.rpc.get_modem_info().await?;
        c.send(Internal::HardwareInfo(info));
        Ok(())
    });

    chain.push("finish-enable", move || async move {
        debug!("classic enable sequence complete");
        Ok(())
    });

    chain
}
