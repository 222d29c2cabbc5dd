/// SQLite-backed mapping store
use crate::{
    error::{BdrsError, BdrsResult},
    store::{
        check_unique_bpns, decode_page_token, encode_page_token, format_timestamp, now_utc,
        parse_timestamp, Committed, MappingRecord, MappingStore, NewMapping, RecordPage,
    },
    validation::{validate_bpn, validate_did},
};
use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;

/// SQLite keeps at most 999 bound variables per statement on older builds
const IN_CLAUSE_CHUNK: usize = 500;

const RECORD_COLUMNS: &str = "bpn, did, version, created_at, updated_at";

/// Mapping store over a shared SQLite pool
#[derive(Clone)]
pub struct SqliteMappingStore {
    db: SqlitePool,
}

impl SqliteMappingStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Current version of a BPN inside an open transaction
    async fn current_version(conn: &mut SqliteConnection, bpn: &str) -> BdrsResult<Option<i64>> {
        let row = sqlx::query("SELECT version FROM bpn_mapping WHERE bpn = ?1")
            .bind(bpn)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("version")?),
            None => None,
        })
    }

    /// Increment the store-wide mutation counter and return the new value.
    /// Must run inside the transaction of the mutation it accounts for.
    async fn bump_directory_version(conn: &mut SqliteConnection, now: &str) -> BdrsResult<i64> {
        let row = sqlx::query(
            r#"
            UPDATE directory_metadata SET version = version + 1, updated_at = ?1
            WHERE id = 1
            RETURNING version
            "#,
        )
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.try_get("version")?)
    }

    async fn insert(
        conn: &mut SqliteConnection,
        bpn: &str,
        did: &str,
        now: &str,
    ) -> BdrsResult<MappingRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO bpn_mapping (bpn, did, version, created_at, updated_at)
            VALUES (?1, ?2, 1, ?3, ?3)
            ON CONFLICT(bpn) DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(bpn)
        .bind(did)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => map_record(&row),
            None => Err(BdrsError::AlreadyExists(format!(
                "A mapping for {} already exists",
                bpn
            ))),
        }
    }

    /// Explain why a conditional write matched no row
    async fn conflict_or_missing(
        conn: &mut SqliteConnection,
        bpn: &str,
        expected: i64,
    ) -> BdrsError {
        match Self::current_version(conn, bpn).await {
            Ok(Some(current)) => BdrsError::VersionConflict {
                bpn: bpn.to_string(),
                expected,
                current,
            },
            Ok(None) => BdrsError::NotFound(format!("No mapping registered for {}", bpn)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn get(&self, bpn: &str) -> BdrsResult<MappingRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM bpn_mapping WHERE bpn = ?1",
            RECORD_COLUMNS
        ))
        .bind(bpn)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => map_record(&row),
            None => Err(BdrsError::NotFound(format!("No mapping registered for {}", bpn))),
        }
    }

    async fn get_many(&self, bpns: &[String]) -> BdrsResult<Vec<MappingRecord>> {
        let mut records = Vec::with_capacity(bpns.len());

        for chunk in bpns.chunks(IN_CLAUSE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM bpn_mapping WHERE bpn IN ({})",
                RECORD_COLUMNS, placeholders
            );

            let mut query = sqlx::query(&sql);
            for bpn in chunk {
                query = query.bind(bpn);
            }

            for row in query.fetch_all(&self.db).await? {
                records.push(map_record(&row)?);
            }
        }

        Ok(records)
    }

    async fn put(
        &self,
        bpn: &str,
        did: &str,
        expected_version: Option<i64>,
    ) -> BdrsResult<Committed<MappingRecord>> {
        validate_bpn(bpn)?;
        validate_did(did)?;

        let now = format_timestamp(&now_utc());
        let mut tx = self.db.begin().await?;

        let record = match expected_version {
            None => Self::insert(&mut tx, bpn, did, &now).await?,
            Some(expected) => {
                let row = sqlx::query(&format!(
                    r#"
                    UPDATE bpn_mapping
                    SET did = ?1, version = version + 1, updated_at = ?2
                    WHERE bpn = ?3 AND version = ?4
                    RETURNING {}
                    "#,
                    RECORD_COLUMNS
                ))
                .bind(did)
                .bind(&now)
                .bind(bpn)
                .bind(expected)
                .fetch_optional(&mut *tx)
                .await?;

                match row {
                    Some(row) => map_record(&row)?,
                    // dropping the transaction rolls it back
                    None => return Err(Self::conflict_or_missing(&mut tx, bpn, expected).await),
                }
            }
        };

        let directory_version = Self::bump_directory_version(&mut tx, &now).await?;
        tx.commit().await?;

        Ok(Committed {
            value: record,
            directory_version,
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

        if entries.is_empty() {
            return Ok(Committed {
                value: Vec::new(),
                directory_version: self.directory_version().await?,
            });
        }

        let now = format_timestamp(&now_utc());
        let mut tx = self.db.begin().await?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(Self::insert(&mut tx, &entry.bpn, &entry.did, &now).await?);
        }

        let directory_version = Self::bump_directory_version(&mut tx, &now).await?;
        tx.commit().await?;

        Ok(Committed {
            value: records,
            directory_version,
        })
    }

    async fn delete(&self, bpn: &str, expected_version: i64) -> BdrsResult<Committed<()>> {
        let now = format_timestamp(&now_utc());
        let mut tx = self.db.begin().await?;

        let result = sqlx::query("DELETE FROM bpn_mapping WHERE bpn = ?1 AND version = ?2")
            .bind(bpn)
            .bind(expected_version)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Self::conflict_or_missing(&mut tx, bpn, expected_version).await);
        }

        let directory_version = Self::bump_directory_version(&mut tx, &now).await?;
        tx.commit().await?;

        Ok(Committed {
            value: (),
            directory_version,
        })
    }

    async fn list_all(&self, page_token: Option<&str>, page_size: usize) -> BdrsResult<RecordPage> {
        let after = match page_token {
            Some(token) => decode_page_token(token)?,
            None => String::new(),
        };

        // One extra row tells whether another page exists
        let rows = sqlx::query(&format!(
            "SELECT {} FROM bpn_mapping WHERE bpn > ?1 ORDER BY bpn LIMIT ?2",
            RECORD_COLUMNS
        ))
        .bind(&after)
        .bind(page_size as i64 + 1)
        .fetch_all(&self.db)
        .await?;

        let mut records = rows
            .iter()
            .map(map_record)
            .collect::<BdrsResult<Vec<_>>>()?;

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
        let rows = sqlx::query(&format!(
            "SELECT {} FROM bpn_mapping WHERE did = ?1 ORDER BY bpn",
            RECORD_COLUMNS
        ))
        .bind(did)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(map_record).collect()
    }

    async fn snapshot(&self) -> BdrsResult<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT bpn, did FROM bpn_mapping")
            .fetch_all(&self.db)
            .await?;

        let mut entries = BTreeMap::new();
        for row in rows {
            entries.insert(row.try_get("bpn")?, row.try_get("did")?);
        }
        Ok(entries)
    }

    async fn directory_version(&self) -> BdrsResult<i64> {
        let row = sqlx::query("SELECT version FROM directory_metadata WHERE id = 1")
            .fetch_optional(&self.db)
            .await?;

        Ok(match row {
            Some(row) => row.try_get("version")?,
            None => 0,
        })
    }

    async fn ping(&self) -> BdrsResult<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}

fn map_record(row: &SqliteRow) -> BdrsResult<MappingRecord> {
    Ok(MappingRecord {
        bpn: row.try_get("bpn")?,
        did: row.try_get("did")?,
        version: row.try_get("version")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}
