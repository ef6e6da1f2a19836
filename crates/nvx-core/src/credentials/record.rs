//! On-disk and export shapes.
//!
//! Every shape is a fixed record: unknown fields are rejected and required
//! fields must be present, so a hand-edited or truncated file fails loudly at
//! the boundary instead of half-loading.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::sealing::SealedSecret;
use crate::{
    domain::{CredentialId, UserId},
    errors::Error,
    Result,
};

pub const RECORD_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Inactive,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub secret: SealedSecret,
    pub name: String,
    pub owner_identity: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
}

impl CredentialRecord {
    pub fn is_usable(&self) -> bool {
        self.lifecycle_state != LifecycleState::Inactive
    }
}

/// The whole credential store as persisted. Rewritten wholesale on every mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StoreRecord {
    pub version: u32,
    pub tokens: BTreeMap<CredentialId, CredentialRecord>,
    pub active_token_id: Option<CredentialId>,
    pub last_updated: DateTime<Utc>,
}

impl StoreRecord {
    pub fn empty() -> Self {
        Self {
            version: RECORD_VERSION,
            tokens: BTreeMap::new(),
            active_token_id: None,
            last_updated: Utc::now(),
        }
    }

    /// Structural checks that serde alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.version != RECORD_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported credential record version {} (expected {RECORD_VERSION})",
                self.version
            )));
        }
        for (key, cred) in &self.tokens {
            if *key != cred.id {
                return Err(Error::Malformed(format!(
                    "credential keyed {key} carries id {}",
                    cred.id
                )));
            }
        }
        Ok(())
    }

    /// The designated credential, if it exists and is usable.
    pub fn designated(&self) -> Option<&CredentialRecord> {
        self.active_token_id
            .as_ref()
            .and_then(|id| self.tokens.get(id))
            .filter(|c| c.is_usable())
    }

    /// Oldest usable credential; the pointer falls back to it.
    pub fn fallback_active(&self) -> Option<CredentialId> {
        self.tokens
            .values()
            .filter(|c| c.is_usable())
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|c| c.id.clone())
    }
}

/// Portable dump produced by export and consumed by import.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExportBlob {
    pub tokens: Vec<ExportEntry>,
    #[serde(default, alias = "exported_at", deserialize_with = "lenient_timestamp")]
    pub exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub includes_secrets: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExportEntry {
    pub id: CredentialId,
    /// Decoded secret, or `None` in a redacted export.
    pub token: Option<String>,
    pub name: String,
    #[serde(alias = "owner_id")]
    pub owner_id: Option<UserId>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
}

/// RFC 3339, or a zone-less `YYYY-MM-DDTHH:MM:SS[.f]` read as UTC (older
/// dashboard exports). Anything else reads as absent.
fn lenient_timestamp<'de, D>(d: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(serde_json::Value::String(raw)) = Option::<serde_json::Value>::deserialize(d)? else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, created_secs: i64, state: LifecycleState) -> CredentialRecord {
        let ts = DateTime::<Utc>::from_timestamp(created_secs, 0).unwrap();
        CredentialRecord {
            id: CredentialId::from(id),
            secret: SealedSecret::Plaintext("s".into()),
            name: id.to_string(),
            owner_identity: None,
            created_at: ts,
            updated_at: ts,
            last_used_at: None,
            lifecycle_state: state,
        }
    }

    #[test]
    fn store_record_json_shape() {
        let mut rec = StoreRecord::empty();
        let c = record("aa", 10, LifecycleState::Active);
        rec.tokens.insert(c.id.clone(), c);
        rec.active_token_id = Some(CredentialId::from("aa"));

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["activeTokenId"], "aa");
        assert!(v["lastUpdated"].is_string());
        assert_eq!(v["tokens"]["aa"]["lifecycleState"], "active");
        assert_eq!(v["tokens"]["aa"]["secret"]["scheme"], "plaintext");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let txt = r#"{"version":1,"tokens":{},"activeTokenId":null,
                      "lastUpdated":"2026-01-01T00:00:00Z","extra":true}"#;
        assert!(serde_json::from_str::<StoreRecord>(txt).is_err());
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let txt = r#"{"version":1,"tokens":{}}"#;
        assert!(serde_json::from_str::<StoreRecord>(txt).is_err());
    }

    #[test]
    fn validate_catches_key_id_mismatch_and_version() {
        let mut rec = StoreRecord::empty();
        rec.tokens
            .insert(CredentialId::from("aa"), record("bb", 1, LifecycleState::Active));
        assert!(matches!(rec.validate(), Err(Error::Malformed(_))));

        let mut rec = StoreRecord::empty();
        rec.version = 2;
        assert!(matches!(rec.validate(), Err(Error::Malformed(_))));
    }

    #[test]
    fn fallback_prefers_oldest_usable() {
        let mut rec = StoreRecord::empty();
        for (id, t, st) in [
            ("cc", 5, LifecycleState::Active),
            ("aa", 1, LifecycleState::Inactive),
            ("bb", 3, LifecycleState::Active),
        ] {
            rec.tokens.insert(CredentialId::from(id), record(id, t, st));
        }
        assert_eq!(rec.fallback_active(), Some(CredentialId::from("bb")));
    }

    #[test]
    fn export_blob_accepts_snake_case_aliases() {
        let txt = r#"{"tokens":[{"id":"x","token":"t","name":"n","owner_id":5,"active":true}],
                      "exported_at":"2026-01-01T00:00:00Z"}"#;
        let blob: ExportBlob = serde_json::from_str(txt).unwrap();
        assert_eq!(blob.tokens[0].owner_id, Some(UserId(5)));
        assert!(!blob.includes_secrets);
        assert_eq!(blob.tokens[0].state, None);
    }

    #[test]
    fn export_blob_accepts_zone_less_dashboard_timestamp() {
        let txt = r#"{"tokens":[{"id":"abc","token":"123:tok","name":"Main","owner_id":111,"active":true}],
                      "exported_at":"2025-05-01T12:00:00.123456"}"#;
        let blob: ExportBlob = serde_json::from_str(txt).unwrap();
        let ts = blob.exported_at.unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-05-01T12:00:00.123456+00:00");

        let missing: ExportBlob = serde_json::from_str(r#"{"tokens":[]}"#).unwrap();
        assert_eq!(missing.exported_at, None);

        let garbage: ExportBlob =
            serde_json::from_str(r#"{"tokens":[],"exportedAt":"last tuesday"}"#).unwrap();
        assert_eq!(garbage.exported_at, None);
    }
}
