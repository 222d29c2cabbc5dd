/// Mapping Store
///
/// Durable persistence for BPN to DID records. Backends implement the
/// [`MappingStore`] contract; the concrete backend is chosen once at startup
/// through [`StoreBackend`].

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryMappingStore;
pub use sqlite::SqliteMappingStore;

use crate::error::{BdrsError, BdrsResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A BPN to DID mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub bpn: String,
    pub did: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entry of a bulk registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMapping {
    pub bpn: String,
    pub did: String,
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<MappingRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Outcome of a committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    /// Directory version written by the same transaction
    pub directory_version: i64,
}

/// Storage contract for mapping records
///
/// Every mutating call is a single transaction: it is either fully applied
/// or has no visible effect.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Current record for a BPN
    async fn get(&self, bpn: &str) -> BdrsResult<MappingRecord>;

    /// Current records for a set of BPNs; missing keys are simply absent
    async fn get_many(&self, bpns: &[String]) -> BdrsResult<Vec<MappingRecord>>;

    /// Create (`expected_version = None`) or compare-and-replace
    async fn put(
        &self,
        bpn: &str,
        did: &str,
        expected_version: Option<i64>,
    ) -> BdrsResult<Committed<MappingRecord>>;

    /// Create many records at once, all or nothing
    async fn put_batch(&self, entries: &[NewMapping])
        -> BdrsResult<Committed<Vec<MappingRecord>>>;

    /// Delete the record if its version matches
    async fn delete(&self, bpn: &str, expected_version: i64) -> BdrsResult<Committed<()>>;

    /// Records ordered by BPN, starting after the page token
    async fn list_all(&self, page_token: Option<&str>, page_size: usize) -> BdrsResult<RecordPage>;

    /// Reverse lookup
    async fn find_by_did(&self, did: &str) -> BdrsResult<Vec<MappingRecord>>;

    /// Full BPN to DID map
    async fn snapshot(&self) -> BdrsResult<BTreeMap<String, String>>;

    /// Store-wide mutation counter
    async fn directory_version(&self) -> BdrsResult<i64>;

    /// Connectivity check
    async fn ping(&self) -> BdrsResult<()>;
}

/// Backend selected at composition time
#[derive(Clone)]
pub enum StoreBackend {
    Sqlite(SqliteMappingStore),
    Memory(InMemoryMappingStore),
}

impl StoreBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite(_) => "sqlite",
            StoreBackend::Memory(_) => "memory",
        }
    }
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            StoreBackend::Sqlite($store) => $call,
            StoreBackend::Memory($store) => $call,
        }
    };
}

#[async_trait]
impl MappingStore for StoreBackend {
    async fn get(&self, bpn: &str) -> BdrsResult<MappingRecord> {
        delegate!(self, s => s.get(bpn).await)
    }

    async fn get_many(&self, bpns: &[String]) -> BdrsResult<Vec<MappingRecord>> {
        delegate!(self, s => s.get_many(bpns).await)
    }

    async fn put(
        &self,
        bpn: &str,
        did: &str,
        expected_version: Option<i64>,
    ) -> BdrsResult<Committed<MappingRecord>> {
        delegate!(self, s => s.put(bpn, did, expected_version).await)
    }

    async fn put_batch(
        &self,
        entries: &[NewMapping],
    ) -> BdrsResult<Committed<Vec<MappingRecord>>> {
        delegate!(self, s => s.put_batch(entries).await)
    }

    async fn delete(&self, bpn: &str, expected_version: i64) -> BdrsResult<Committed<()>> {
        delegate!(self, s => s.delete(bpn, expected_version).await)
    }

    async fn list_all(&self, page_token: Option<&str>, page_size: usize) -> BdrsResult<RecordPage> {
        delegate!(self, s => s.list_all(page_token, page_size).await)
    }

    async fn find_by_did(&self, did: &str) -> BdrsResult<Vec<MappingRecord>> {
        delegate!(self, s => s.find_by_did(did).await)
    }

    async fn snapshot(&self) -> BdrsResult<BTreeMap<String, String>> {
        delegate!(self, s => s.snapshot().await)
    }

    async fn directory_version(&self) -> BdrsResult<i64> {
        delegate!(self, s => s.directory_version().await)
    }

    async fn ping(&self) -> BdrsResult<()> {
        delegate!(self, s => s.ping().await)
    }
}

/// Server-assigned timestamp, truncated to what the database keeps
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Database representation of a timestamp
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC3339 timestamp
pub fn parse_timestamp(s: &str) -> BdrsResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BdrsError::Internal(format!("Invalid timestamp: {}", e)))
}

/// Opaque page token for the last key of a page
pub fn encode_page_token(last_bpn: &str) -> String {
    URL_SAFE_NO_PAD.encode(last_bpn.as_bytes())
}

pub fn decode_page_token(token: &str) -> BdrsResult<String> {
    URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| BdrsError::Validation("Malformed page token".to_string()))
}

/// Ensure a bulk registration carries each BPN once
pub(crate) fn check_unique_bpns(entries: &[NewMapping]) -> BdrsResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.bpn.as_str()) {
            return Err(BdrsError::Validation(format!(
                "Duplicate BPN in batch: {}",
                entry.bpn
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_token_round_trip() {
        let token = encode_page_token("BPNL000000000007");
        assert_eq!(decode_page_token(&token).unwrap(), "BPNL000000000007");
        assert!(decode_page_token("not base64 !").is_err());
    }

    #[test]
    fn test_timestamp_format_is_lossless() {
        let now = now_utc();
        let parsed = parse_timestamp(&format_timestamp(&now)).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_duplicate_bpns_rejected() {
        let entries = vec![
            NewMapping {
                bpn: "BPNL000000000001".to_string(),
                did: "did:web:a.example".to_string(),
            },
            NewMapping {
                bpn: "BPNL000000000001".to_string(),
                did: "did:web:b.example".to_string(),
            },
        ];
        assert!(matches!(
            check_unique_bpns(&entries),
            Err(BdrsError::Validation(_))
        ));
    }
}
