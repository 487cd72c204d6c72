//! APN candidate selection and connect fallback.
//!
//! A negotiator is built fresh for every connect attempt. It assembles the
//! try list (user override first, then the last APN that worked for this SIM,
//! then the carrier database) and walks it: an invalid-APN failure discards
//! the front candidate and retries immediately, ending with one bare attempt
//! once the list runs dry. The winning candidate is persisted per ICCID.

use crate::apn_db::ApnDatabase;
use crate::modem_manager::{
    ApnAuthMethod, BearerPath, ConnectProperties, ModemManager, Result,
};
use crate::store::{Store, NS_LAST_GOOD_APN};
use bon::bon;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnCandidate {
    pub apn: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_method: Option<ApnAuthMethod>,
}

impl ApnCandidate {
    pub fn new(apn: impl Into<String>) -> Self {
        Self {
            apn: apn.into(),
            username: None,
            password: None,
            auth_method: None,
        }
    }

    fn connect_properties(&self, allow_roaming: bool) -> ConnectProperties {
        ConnectProperties {
            apn: Some(self.apn.clone()),
            username: self.username.clone(),
            password: self.password.clone(),
            auth_method: self.auth_method,
            allow_roaming,
        }
    }
}

pub struct ApnNegotiator {
    rpc: Arc<dyn ModemManager>,
    store: Arc<Store>,
    db: Arc<dyn ApnDatabase>,
    iccid: Option<String>,
    operator_id: Option<String>,
    spn: Option<String>,
    user_apn: Option<ApnCandidate>,
    allow_roaming: bool,
    try_list: VecDeque<ApnCandidate>,
}

#[bon]
impl ApnNegotiator {
    #[builder]
    pub fn new(
        rpc: Arc<dyn ModemManager>,
        store: Arc<Store>,
        db: Arc<dyn ApnDatabase>,
        iccid: Option<String>,
        operator_id: Option<String>,
        spn: Option<String>,
        user_apn: Option<ApnCandidate>,
        #[builder(default = false)] allow_roaming: bool,
    ) -> Self {
        Self {
            rpc,
            store,
            db,
            iccid,
            operator_id,
            spn,
            user_apn,
            allow_roaming,
            try_list: VecDeque::new(),
        }
    }

    /// Assemble the try list: user override, last-known-good, then the
    /// carrier database entries, in that priority order.
    pub fn build_try_list(&mut self) {
        let mut list = VecDeque::new();

        if let Some(user) = &self.user_apn {
            list.push_back(user.clone());
        }
        if let Some(last_good) = self.last_good_apn() {
            list.push_back(last_good);
        }
        for candidate in self
            .db
            .lookup(self.operator_id.as_deref(), self.spn.as_deref())
        {
            list.push_back(candidate);
        }

        debug!(candidates = list.len(), "built apn try list");
        self.try_list = list;
    }

    pub fn try_list(&self) -> &VecDeque<ApnCandidate> {
        &self.try_list
    }

    /// Issue the connect RPC, falling through the try list on invalid-APN
    /// failures. Once the list is exhausted one bare attempt without an APN
    /// is made; some modems accept that.
    pub async fn connect(&mut self) -> Result<BearerPath> {
        loop {
            let candidate = self.try_list.front().cloned();
            let props = match &candidate {
                Some(c) => {
                    debug!(apn = %c.apn, "connecting");
                    c.connect_properties(self.allow_roaming)
                }
                None => {
                    debug!("connecting without an apn");
                    ConnectProperties {
                        allow_roaming: self.allow_roaming,
                        ..Default::default()
                    }
                }
            };

            match self.rpc.connect(props).await {
                Ok(bearer) => {
                    if let Some(c) = candidate {
                        self.record_last_good(&c).await;
                    }
                    self.try_list.clear();
                    return Ok(bearer);
                }
                Err(e) => {
                    self.clear_last_good().await;
                    if e.is_retriable_connect() && !self.try_list.is_empty() {
                        self.try_list.pop_front();
                        debug!(
                            remaining = self.try_list.len(),
                            "connect failed with invalid apn, trying next candidate"
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn last_good_apn(&self) -> Option<ApnCandidate> {
        let iccid = self.iccid.as_deref()?;
        let json = self.store.get(NS_LAST_GOOD_APN, iccid)?;
        match serde_json::from_str(&json) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("discarding unreadable last-good apn entry: {e}");
                None
            }
        }
    }

    async fn record_last_good(&self, candidate: &ApnCandidate) {
        let Some(iccid) = self.iccid.as_deref() else {
            return;
        };
        match serde_json::to_string(candidate) {
            Ok(json) => {
                if let Err(e) = self.store.set(NS_LAST_GOOD_APN, iccid, &json).await {
                    warn!("failed to persist last-good apn: {e}");
                }
            }
            Err(e) => warn!("failed to serialize last-good apn: {e}"),
        }
    }

    async fn clear_last_good(&self) {
        let Some(iccid) = self.iccid.as_deref() else {
            return;
        };
        if let Err(e) = self.store.remove(NS_LAST_GOOD_APN, iccid).await {
            warn!("failed to clear last-good apn: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apn_db::JsonApnDatabase;
    use crate::modem_manager::{MockModemManager, ModemError};
    use async_tempfile::TempDir;
    use proptest::prelude::*;
    use std::sync::Mutex;

    const DB: &str = r#"{
        "26202": {
            "name": "Vodafone",
            "country": "de",
            "apns": [{ "apn": "db-first" }, { "apn": "db-second" }]
        }
    }"#;

    async fn store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().await.unwrap();
        let store = Store::open(dir.to_path_buf().join("store.json"))
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    fn negotiator(
        rpc: MockModemManager,
        store: Arc<Store>,
        user_apn: Option<ApnCandidate>,
    ) -> ApnNegotiator {
        ApnNegotiator::builder()
            .rpc(Arc::new(rpc))
            .store(store)
            .db(Arc::new(JsonApnDatabase::from_json(DB).unwrap()))
            .iccid("89011234".to_string())
            .operator_id("26202".to_string())
            .maybe_user_apn(user_apn)
            .build()
    }

    #[tokio::test]
    async fn try_list_orders_user_then_last_good_then_database() {
        let (_dir, store) = store().await;
        store
            .set(
                NS_LAST_GOOD_APN,
                "89011234",
                &serde_json::to_string(&ApnCandidate::new("remembered")).unwrap(),
            )
            .await
            .unwrap();

        let mut negotiator = negotiator(
            MockModemManager::new(),
            store,
            Some(ApnCandidate::new("user-override")),
        );
        negotiator.build_try_list();

        let apns: Vec<_> = negotiator.try_list().iter().map(|c| c.apn.clone()).collect();
        assert_eq!(apns, vec!["user-override", "remembered", "db-first", "db-second"]);
    }

    #[tokio::test]
    async fn an_invalid_apn_falls_through_to_the_next_candidate() {
        let (_dir, store) = store().await;
        let attempts: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

        let mut rpc = MockModemManager::new();
        let log = Arc::clone(&attempts);
        rpc.expect_connect().times(2).returning(move |props| {
            log.lock().unwrap().push(props.apn.clone());
            if props.apn.as_deref() == Some("db-first") {
                Err(ModemError::InvalidApn("rejected".into()))
            } else {
                Ok(BearerPath("/bearer/0".into()))
            }
        });

        let mut negotiator = negotiator(rpc, Arc::clone(&store), None);
        negotiator.build_try_list();
        let bearer = negotiator.connect().await.unwrap();

        assert_eq!(bearer, BearerPath("/bearer/0".into()));
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![Some("db-first".into()), Some("db-second".into())]
        );
        assert!(negotiator.try_list().is_empty());
        // The winner is remembered for next time.
        assert!(store.get(NS_LAST_GOOD_APN, "89011234").unwrap().contains("db-second"));
    }

    #[tokio::test]
    async fn a_non_retriable_error_surfaces_immediately() {
        let (_dir, store) = store().await;

        let mut rpc = MockModemManager::new();
        rpc.expect_connect()
            .times(1)
            .returning(|_| Err(ModemError::WrongState("not registered".into())));

        let mut negotiator = negotiator(rpc, store, None);
        negotiator.build_try_list();
        let err = negotiator.connect().await.unwrap_err();

        assert_eq!(err, ModemError::WrongState("not registered".into()));
        // Remaining candidates stay queued; nothing was consumed.
        assert_eq!(negotiator.try_list().len(), 2);
    }

    proptest! {
        // N candidates, N invalid-APN failures: the list drains and the
        // (N+1)-th attempt goes out bare.
        #[test]
        fn exhaustion_ends_with_one_bare_attempt(n in 1usize..6) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async move {
                let (_dir, store) = store().await;
                let attempts: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

                let mut rpc = MockModemManager::new();
                let log = Arc::clone(&attempts);
                rpc.expect_connect()
                    .times(n + 1)
                    .returning(move |props| {
                        log.lock().unwrap().push(props.apn.clone());
                        Err(ModemError::InvalidApn("rejected".into()))
                    });

                let mut negotiator = ApnNegotiator::builder()
                    .rpc(Arc::new(rpc))
                    .store(store)
                    .db(Arc::new(crate::apn_db::NullApnDatabase))
                    .build();
                negotiator.try_list = (0..n)
                    .map(|i| ApnCandidate::new(format!("apn-{i}")))
                    .collect();

                let err = negotiator.connect().await.unwrap_err();
                assert_eq!(err, ModemError::InvalidApn("rejected".into()));

                let attempts = attempts.lock().unwrap();
                assert_eq!(attempts.len(), n + 1);
                assert_eq!(attempts.last().unwrap(), &None);
                assert!(negotiator.try_list().is_empty());
            });
        }
    }
}
