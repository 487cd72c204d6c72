//! Read-only carrier APN database.
//!
//! Maps an operator id (MCCMNC derived from the IMSI) or a SIM-reported SPN
//! to the carrier's candidate connection profiles and display identity.
//! Loaded once at daemon start from a JSON image.

use crate::apn::ApnCandidate;
use color_eyre::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CarrierInfo {
    pub name: String,
    pub country: String,
}

pub trait ApnDatabase: Send + Sync + 'static {
    /// Candidate profiles for the carrier, best first. Empty when the
    /// carrier is unknown.
    fn lookup(&self, operator_id: Option<&str>, spn: Option<&str>) -> Vec<ApnCandidate>;

    fn carrier(&self, operator_id: &str) -> Option<CarrierInfo>;

    /// Derive the operator id from an IMSI. MNCs are two or three digits, so
    /// prefer the longest known prefix.
    fn operator_id_from_imsi(&self, imsi: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct CarrierEntry {
    name: String,
    country: String,
    #[serde(default)]
    spn: Option<String>,
    #[serde(default)]
    apns: Vec<ApnCandidate>,
}

/// JSON-backed [`ApnDatabase`], keyed by MCCMNC.
pub struct JsonApnDatabase {
    carriers: HashMap<String, CarrierEntry>,
}

impl JsonApnDatabase {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let carriers: HashMap<String, CarrierEntry> = serde_json::from_slice(&bytes)?;
        debug!(carriers = carriers.len(), "loaded apn database");
        Ok(Self { carriers })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let carriers = serde_json::from_str(json)?;
        Ok(Self { carriers })
    }
}

impl ApnDatabase for JsonApnDatabase {
    fn lookup(&self, operator_id: Option<&str>, spn: Option<&str>) -> Vec<ApnCandidate> {
        if let Some(entry) = operator_id.and_then(|id| self.carriers.get(id)) {
            return entry.apns.clone();
        }

        if let Some(spn) = spn {
            for entry in self.carriers.values() {
                if entry.spn.as_deref() == Some(spn) {
                    return entry.apns.clone();
                }
            }
        }

        Vec::new()
    }

    fn carrier(&self, operator_id: &str) -> Option<CarrierInfo> {
        self.carriers.get(operator_id).map(|e| CarrierInfo {
            name: e.name.clone(),
            country: e.country.clone(),
        })
    }

    fn operator_id_from_imsi(&self, imsi: &str) -> Option<String> {
        for len in [6, 5] {
            if imsi.len() < len {
                continue;
            }
            let prefix = &imsi[..len];
            if self.carriers.contains_key(prefix) {
                return Some(prefix.to_string());
            }
        }
        None
    }
}

/// An empty database; lookups find nothing.
pub struct NullApnDatabase;

impl ApnDatabase for NullApnDatabase {
    fn lookup(&self, _operator_id: Option<&str>, _spn: Option<&str>) -> Vec<ApnCandidate> {
        Vec::new()
    }

    fn carrier(&self, _operator_id: &str) -> Option<CarrierInfo> {
        None
    }

    fn operator_id_from_imsi(&self, _imsi: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"{
        "26202": {
            "name": "Vodafone",
            "country": "de",
            "spn": "vodafone.de",
            "apns": [
                { "apn": "web.vodafone.de" },
                { "apn": "event.vodafone.de", "username": "vf", "password": "vf" }
            ]
        },
        "310260": {
            "name": "T-Mobile",
            "country": "us",
            "apns": [{ "apn": "fast.t-mobile.com" }]
        }
    }"#;

    #[test]
    fn it_looks_up_by_operator_id() {
        let db = JsonApnDatabase::from_json(DB).unwrap();

        let apns = db.lookup(Some("26202"), None);

        assert_eq!(apns.len(), 2);
        assert_eq!(apns[0].apn, "web.vodafone.de");
        assert_eq!(db.carrier("26202").unwrap().name, "Vodafone");
    }

    #[test]
    fn it_falls_back_to_spn() {
        let db = JsonApnDatabase::from_json(DB).unwrap();

        let apns = db.lookup(Some("99999"), Some("vodafone.de"));

        assert_eq!(apns.len(), 2);
    }

    #[test]
    fn it_prefers_the_longer_mccmnc_prefix() {
        let db = JsonApnDatabase::from_json(DB).unwrap();

        assert_eq!(
            db.operator_id_from_imsi("310260123456789").as_deref(),
            Some("310260")
        );
        assert_eq!(
            db.operator_id_from_imsi("262021234567890").as_deref(),
            Some("26202")
        );
        assert_eq!(db.operator_id_from_imsi("00000"), None);
    }
}
