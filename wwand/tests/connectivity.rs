mod fixture;

use fixture::{Fixture, MockModem, SlowModem};
use std::sync::{Arc, Mutex};
use wwand::apn::ApnCandidate;
use wwand::modem_manager::{
    BearerPath, ModemError, ModemSignal, PropertiesChanged, SimProperties,
    TechnologyFamily,
};

#[tokio::test]
async fn connect_falls_back_through_the_try_list() {
    let attempts: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    let mut rpc = MockModem::new();
    {
        let attempts = Arc::clone(&attempts);
        rpc.expect_connect().returning(move |props| {
            attempts.lock().unwrap().push(props.apn.clone());
            match props.apn.as_deref() {
                Some("event.vodafone.de") => Ok(BearerPath("/bearer/3".into())),
                _ => Err(ModemError::InvalidApn("rejected by network".into())),
            }
        });
    }
    fixture::fill_defaults(&mut rpc);

    let fixture = Fixture::new(rpc, TechnologyFamily::Universal).await;

    // Teach the capability its home carrier so the database contributes.
    fixture.send(ModemSignal::Properties(PropertiesChanged::Sim(
        SimProperties {
            imsi: Some("262021234567890".into()),
            ..Default::default()
        },
    )));
    fixture
        .wait_identity(|id| id.home_operator_id.as_deref() == Some("26202"))
        .await;

    let bearer = fixture
        .capability
        .connect(Some(ApnCandidate::new("user-apn")))
        .await
        .unwrap();

    assert_eq!(bearer, BearerPath("/bearer/3".into()));
    assert_eq!(
        *attempts.lock().unwrap(),
        vec![
            Some("user-apn".into()),
            Some("web.vodafone.de".into()),
            Some("event.vodafone.de".into()),
        ]
    );
}

#[tokio::test]
async fn concurrent_connects_are_rejected() {
    let rpc = SlowModem::default();
    let fixture = Fixture::new(rpc.clone(), TechnologyFamily::Universal).await;

    let capability = fixture.capability.clone();
    let first = tokio::spawn(async move { capability.connect(None).await });
    tokio::task::yield_now().await;

    let err = fixture.capability.connect(None).await.unwrap_err();
    assert_eq!(err, ModemError::AlreadyInProgress("connect".into()));

    rpc.release();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn a_second_reset_while_one_is_outstanding_is_rejected() {
    let rpc = SlowModem::default();
    let fixture = Fixture::new(rpc.clone(), TechnologyFamily::Universal).await;

    let capability = fixture.capability.clone();
    let first = tokio::spawn(async move { capability.reset().await });
    tokio::task::yield_now().await;

    let err = fixture.capability.reset().await.unwrap_err();
    assert_eq!(err, ModemError::AlreadyInProgress("reset".into()));

    rpc.release();
    first.await.unwrap().unwrap();

    // Once the first completes, resetting is allowed again.
    let capability = fixture.capability.clone();
    let again = tokio::spawn(async move { capability.reset().await });
    tokio::task::yield_now().await;
    rpc.release();
    again.await.unwrap().unwrap();
}

#[tokio::test]
async fn pin_operations_forward_to_the_service() {
    let mut rpc = MockModem::new();
    rpc.expect_enter_pin()
        .withf(|pin| pin == "1234")
        .times(1)
        .returning(|_| Ok(()));
    rpc.expect_unblock_pin()
        .withf(|puk, pin| puk == "87654321" && pin == "4321")
        .times(1)
        .returning(|_, _| Ok(()));
    rpc.expect_require_pin()
        .withf(|pin, require| pin == "4321" && *require)
        .times(1)
        .returning(|_, _| Ok(()));
    rpc.expect_change_pin()
        .withf(|old, new| old == "4321" && new == "1111")
        .times(1)
        .returning(|_, _| Ok(()));

    let fixture = Fixture::new(rpc, TechnologyFamily::Universal).await;

    fixture.capability.enter_pin("1234").await.unwrap();
    fixture
        .capability
        .unblock_pin("87654321", "4321")
        .await
        .unwrap();
    fixture.capability.require_pin("4321", true).await.unwrap();
    fixture.capability.change_pin("4321", "1111").await.unwrap();
}
