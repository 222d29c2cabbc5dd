/// In-memory mapping store for development and tests
use crate::{
    error::{BdrsError, BdrsResult},
    store::{
        check_unique_bpns, decode_page_token, encode_page_token, now_utc, Committed,
        MappingRecord, MappingStore, NewMapping, RecordPage,
    },
    validation::{validate_bpn, validate_did},
};
use async_trait::async_trait;
use std::{collections::BTreeMap, ops::Bound, sync::Arc};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, MappingRecord>,
    directory_version: i64,
}

impl Inner {
    fn bump_version(&mut self) -> i64 {
        self.directory_version += 1;
        self.directory_version
    }

    fn conflict_or_missing(&self, bpn: &str, expected: i64) -> BdrsError {
        match self.records.get(bpn) {
            Some(current) => BdrsError::VersionConflict {
                bpn: bpn.to_string(),
                expected,
                current: current.version,
            },
            None => BdrsError::NotFound(format!("No mapping registered for {}", bpn)),
        }
    }
}

/// Mapping store kept in process memory
///
/// All mutations take the write lock, so each one is atomic with respect
/// to every other call.
#[derive(Clone, Default)]
pub struct InMemoryMappingStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn get(&self, bpn: &str) -> BdrsResult<MappingRecord> {
        self.inner
            .read()
            .await
            .records
            .get(bpn)
            .cloned()
            .ok_or_else(|| BdrsError::NotFound(format!("No mapping registered for {}", bpn)))
    }

    async fn get_many(&self, bpns: &[String]) -> BdrsResult<Vec<MappingRecord>> {
        let inner = self.inner.read().await;
        Ok(bpns
            .iter()
            .filter_map(|bpn| inner.records.get(bpn).cloned())
            .collect())
    }

    async fn put(
        &self,
        bpn: &str,
        did: &str,
        expected_version: Option<i64>,
    ) -> BdrsResult<Committed<MappingRecord>> {
        validate_bpn(bpn)?;
        validate_did(did)?;

        let mut inner = self.inner.write().await;
        let now = now_utc();

        let record = match expected_version {
            None => {
                if inner.records.contains_key(bpn) {
                    return Err(BdrsError::AlreadyExists(format!(
                        "A mapping for {} already exists",
                        bpn
                    )));
                }
                MappingRecord {
                    bpn: bpn.to_string(),
                    did: did.to_string(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                }
            }
            Some(expected) => match inner.records.get(bpn) {
                Some(current) if current.version == expected => MappingRecord {
                    did: did.to_string(),
                    version: current.version + 1,
                    updated_at: now,
                    ..current.clone()
                },
                _ => return Err(inner.conflict_or_missing(bpn, expected)),
            },
        };

        inner.records.insert(bpn.to_string(), record.clone());

        Ok(Committed {
            value: record,
            directory_version: inner.bump_version(),
        })
    }

    async fn put_batch(
        &self,
        entries: &[NewMapping],
    ) -> BdrsResult<Committed<Vec<MappingRecord>>> {
        for entry in entries {
            validate_bpn(&entry.bpn)?;
            validate_did(&entry.did)?;
        }
        check_unique_bpns(entries)?;

        let mut inner = self.inner.write().await;

        if entries.is_empty() {
            return Ok(Committed {
                value: Vec::new(),
                directory_version: inner.directory_version,
            });
        }

        // Check everything before touching the map
        if let Some(existing) = entries.iter().find(|e| inner.records.contains_key(&e.bpn)) {
            return Err(BdrsError::AlreadyExists(format!(
                "A mapping for {} already exists",
                existing.bpn
            )));
        }

        let now = now_utc();
        let records: Vec<MappingRecord> = entries
            .iter()
            .map(|entry| MappingRecord {
                bpn: entry.bpn.clone(),
                did: entry.did.clone(),
                version: 1,
                created_at: now,
                updated_at: now,
            })
            .collect();

        for record in &records {
            inner.records.insert(record.bpn.clone(), record.clone());
        }

        Ok(Committed {
            value: records,
            directory_version: inner.bump_version(),
        })
    }

    async fn delete(&self, bpn: &str, expected_version: i64) -> BdrsResult<Committed<()>> {
        let mut inner = self.inner.write().await;

        match inner.records.get(bpn) {
            Some(current) if current.version == expected_version => {
                inner.records.remove(bpn);
                Ok(Committed {
                    value: (),
                    directory_version: inner.bump_version(),
                })
            }
            _ => Err(inner.conflict_or_missing(bpn, expected_version)),
        }
    }

    async fn list_all(&self, page_token: Option<&str>, page_size: usize) -> BdrsResult<RecordPage> {
        let after = page_token.map(decode_page_token).transpose()?;
        let lower = match &after {
            Some(bpn) => Bound::Excluded(bpn.clone()),
            None => Bound::Unbounded,
        };

        let inner = self.inner.read().await;
        let mut records: Vec<MappingRecord> = inner
            .records
            .range((lower, Bound::Unbounded))
            .take(page_size + 1)
            .map(|(_, record)| record.clone())
            .collect();

        let next_page_token = if records.len() > page_size {
            records.truncate(page_size);
            records.last().map(|r| encode_page_token(&r.bpn))
        } else {
            None
        };

        Ok(RecordPage {
            records,
            next_page_token,
        })
    }

    async fn find_by_did(&self, did: &str) -> BdrsResult<Vec<MappingRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|record| record.did == did)
            .cloned()
            .collect())
    }

    async fn snapshot(&self) -> BdrsResult<BTreeMap<String, String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .map(|(bpn, record)| (bpn.clone(), record.did.clone()))
            .collect())
    }

    async fn directory_version(&self) -> BdrsResult<i64> {
        Ok(self.inner.read().await.directory_version)
    }

    async fn ping(&self) -> BdrsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BPN: &str = "BPNL000000000001";

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = InMemoryMappingStore::new();

        let created = store.put(BPN, "did:web:example.com", None).await.unwrap();
        assert_eq!(created.value.version, 1);
        assert_eq!(created.directory_version, 1);

        let updated = store.put(BPN, "did:web:example.org", Some(1)).await.unwrap();
        assert_eq!(updated.value.version, 2);
        assert_eq!(updated.value.created_at, created.value.created_at);
        assert_eq!(updated.directory_version, 2);

        assert!(matches!(
            store.put(BPN, "did:web:x.org", Some(1)).await,
            Err(BdrsError::VersionConflict { current: 2, .. })
        ));

        let deleted = store.delete(BPN, 2).await.unwrap();
        assert_eq!(deleted.directory_version, 3);
        assert!(matches!(store.get(BPN).await, Err(BdrsError::NotFound(_))));
        assert_eq!(store.directory_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_recreate_after_delete_starts_at_version_one() {
        let store = InMemoryMappingStore::new();
        store.put(BPN, "did:web:example.com", None).await.unwrap();
        store.delete(BPN, 1).await.unwrap();

        let again = store.put(BPN, "did:web:example.com", None).await.unwrap();
        assert_eq!(again.value.version, 1);
    }

    #[tokio::test]
    async fn test_batch_rejects_existing_without_side_effects() {
        let store = InMemoryMappingStore::new();
        store.put("BPNL000000000002", "did:web:two.example", None).await.unwrap();

        let entries = vec![
            NewMapping {
                bpn: "BPNL000000000001".to_string(),
                did: "did:web:one.example".to_string(),
            },
            NewMapping {
                bpn: "BPNL000000000002".to_string(),
                did: "did:web:dup.example".to_string(),
            },
        ];
        assert!(matches!(
            store.put_batch(&entries).await,
            Err(BdrsError::AlreadyExists(_))
        ));
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
        assert_eq!(store.directory_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_all_pagination() {
        let store = InMemoryMappingStore::new();
        for i in 1..=3 {
            store
                .put(&format!("BPNL00000000000{}", i), "did:web:example.com", None)
                .await
                .unwrap();
        }

        let first = store.list_all(None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);

        let second = store
            .list_all(first.next_page_token.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].bpn, "BPNL000000000003");
        assert!(second.next_page_token.is_none());
    }
}
