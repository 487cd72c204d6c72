mod fixture;

use fixture::{Fixture, MockModem};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use wwand::activation::SubscriptionState;
use wwand::modem_manager::{
    BearerPath, Modem3gppProperties, ModemSignal, PropertiesChanged, SimProperties,
    TechnologyFamily,
};
use wwand::registration::RegistrationState;
use wwand::store::NS_PENDING_ACTIVATION;
use wwand_events::{Event, Subscription};

const ICCID: &str = "8901123456789001234";

fn sim_signal(iccid: &str) -> ModemSignal {
    ModemSignal::Properties(PropertiesChanged::Sim(SimProperties {
        iccid: Some(iccid.into()),
        ..Default::default()
    }))
}

fn registered_signal() -> ModemSignal {
    ModemSignal::Properties(PropertiesChanged::Modem3gpp(Modem3gppProperties {
        registration_state: Some(RegistrationState::Home),
        operator_code: Some("26202".into()),
        operator_name: Some("vodafone.de".into()),
        ..Default::default()
    }))
}

#[tokio::test]
async fn complete_activation_persists_progress_across_the_reset() {
    let resets = Arc::new(Mutex::new(0u32));
    let mut rpc = MockModem::new();
    {
        let resets = Arc::clone(&resets);
        rpc.expect_reset().returning(move || {
            *resets.lock().unwrap() += 1;
            Ok(())
        });
    }
    fixture::fill_defaults(&mut rpc);

    let fixture = Fixture::new(rpc, TechnologyFamily::Universal).await;
    fixture.send(sim_signal(ICCID));
    fixture.wait_identity(|id| id.iccid.is_some()).await;

    fixture.capability.complete_activation().await.unwrap();

    // Pending is recorded, the reset runs, and its completion promotes the
    // record to activated.
    fixture
        .wait_store(NS_PENDING_ACTIVATION, ICCID, Some("activated"))
        .await;
    assert_eq!(*resets.lock().unwrap(), 1);
}

#[tokio::test]
async fn registration_after_activation_auto_connects_exactly_once() {
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let mut rpc = MockModem::new();
    rpc.expect_reset().returning(|| Ok(()));
    rpc.expect_connect().times(1).returning(move |props| {
        // Auto-connect carries no override; candidates come from history/db.
        connected_tx.send(props.apn.clone()).unwrap();
        Ok(BearerPath("/bearer/0".into()))
    });
    fixture::fill_defaults(&mut rpc);

    let fixture = Fixture::new(rpc, TechnologyFamily::Universal).await;
    fixture.capability.start_modem().await.unwrap();
    fixture.send(sim_signal(ICCID));
    fixture.wait_identity(|id| id.iccid.is_some()).await;

    fixture.capability.complete_activation().await.unwrap();
    fixture
        .wait_store(NS_PENDING_ACTIVATION, ICCID, Some("activated"))
        .await;

    fixture.send(registered_signal());

    connected_rx.recv().await.expect("auto-connect must fire");
}

#[tokio::test]
async fn a_provisioned_subscription_clears_the_record() {
    let mut rpc = MockModem::new();
    rpc.expect_reset().returning(|| Ok(()));
    fixture::fill_defaults(&mut rpc);

    let mut fixture = Fixture::new(rpc, TechnologyFamily::Universal).await;
    fixture.send(sim_signal(ICCID));
    fixture.wait_identity(|id| id.iccid.is_some()).await;

    fixture.capability.complete_activation().await.unwrap();
    fixture
        .wait_store(NS_PENDING_ACTIVATION, ICCID, Some("activated"))
        .await;

    // The carrier starts reporting the subscription as provisioned.
    fixture.send(ModemSignal::Properties(PropertiesChanged::Modem3gpp(
        Modem3gppProperties {
            subscription_state: Some(SubscriptionState::Provisioned),
            ..Default::default()
        },
    )));

    let state = fixture
        .next_event(|event| match event {
            Event::SubscriptionStateChanged { state } => Some(*state),
            _ => None,
        })
        .await;
    assert_eq!(state, Subscription::Provisioned);

    fixture.wait_store(NS_PENDING_ACTIVATION, ICCID, None).await;
}
