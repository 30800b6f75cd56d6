use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use toolgrid_types::{ApiKeyId, TenantId};

use super::db::{time, Db, StorageResult};
use super::servers::parse_id;

/// Stored API key metadata. Only a SHA-256 hash of the key material is
/// kept; the plaintext exists once, in the creation response.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub name: String,
    pub tenant_id: Option<TenantId>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ApiKeyStore {
    db: Db,
}

pub fn hash_key(key: &str) -> String {
    const_hex::encode(Sha256::digest(key.as_bytes()))
}

impl ApiKeyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert(
        &self,
        name: &str,
        key: &str,
        tenant_id: Option<TenantId>,
    ) -> StorageResult<ApiKeyRecord> {
        let record = ApiKeyRecord {
            id: ApiKeyId::generate(),
            name: name.to_string(),
            tenant_id,
            enabled: true,
            created_at: Utc::now(),
            last_used_at: None,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO api_keys (id, name, key_hash, tenant_id, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    record.id.as_ref(),
                    record.name,
                    hash_key(key),
                    record.tenant_id.as_ref().map(|t| t.as_ref()),
                    time::to_sql(record.created_at),
                ],
            )
        })?;

        Ok(record)
    }

    /// Resolves presented key material to an enabled key record,
    /// stamping `last_used_at` on the way through.
    pub fn authenticate(&self, key: &str) -> StorageResult<Option<ApiKeyRecord>> {
        let hash = hash_key(key);
        let record = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, tenant_id, enabled, created_at, last_used_at
                 FROM api_keys WHERE key_hash = ?1 AND enabled = 1",
                [hash.as_str()],
                |row| {
                    Ok(ApiKeyRecord {
                        id: parse_id(row, 0)?,
                        name: row.get(1)?,
                        tenant_id: row
                            .get::<_, Option<String>>(2)?
                            .map(|raw| parse_tenant(raw))
                            .transpose()?,
                        enabled: row.get(3)?,
                        created_at: time::from_sql(&row.get::<_, String>(4)?),
                        last_used_at: time::opt_from_sql(row.get(5)?),
                    })
                },
            )
            .optional()
        })?;

        if let Some(record) = &record {
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
                    params![record.id.as_ref(), time::to_sql(Utc::now())],
                )
            })?;
        }

        Ok(record)
    }

    pub fn set_enabled(&self, id: &ApiKeyId, enabled: bool) -> StorageResult<bool> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE api_keys SET enabled = ?2 WHERE id = ?1",
                params![id.as_ref(), enabled],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> StorageResult<Vec<ApiKeyRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, tenant_id, enabled, created_at, last_used_at
                 FROM api_keys ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ApiKeyRecord {
                    id: parse_id(row, 0)?,
                    name: row.get(1)?,
                    tenant_id: row
                        .get::<_, Option<String>>(2)?
                        .map(|raw| parse_tenant(raw))
                        .transpose()?,
                    enabled: row.get(3)?,
                    created_at: time::from_sql(&row.get::<_, String>(4)?),
                    last_used_at: time::opt_from_sql(row.get(5)?),
                })
            })?;
            rows.collect()
        })
    }
}

fn parse_tenant(raw: String) -> rusqlite::Result<TenantId> {
    TenantId::new(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;

    fn store() -> ApiKeyStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        ApiKeyStore::new(db)
    }

    #[test]
    fn authenticate_matches_hash_only() {
        let store = store();
        let record = store.insert("ci", "tg_secret_123", None).unwrap();

        let found = store.authenticate("tg_secret_123").unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert!(store.authenticate("wrong").unwrap().is_none());
    }

    #[test]
    fn disabled_keys_do_not_authenticate() {
        let store = store();
        let record = store.insert("ci", "tg_secret_123", None).unwrap();
        store.set_enabled(&record.id, false).unwrap();
        assert!(store.authenticate("tg_secret_123").unwrap().is_none());
    }
}
