use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use toolgrid_types::{GroupId, ServerConfig, ServerGroup, ServerId};

use super::db::{time, Db, StorageError, StorageResult};

#[derive(Clone)]
pub struct ServerStore {
    db: Db,
}

impl ServerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert(&self, cfg: &ServerConfig) -> StorageResult<()> {
        let now = time::to_sql(Utc::now());
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO servers
                 (id, name, transport, auth, health_check, rate_limits, metadata, group_id, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    cfg.id.as_ref(),
                    cfg.name,
                    serde_json::to_string(&cfg.transport).unwrap(),
                    cfg.auth.as_ref().map(|a| serde_json::to_string(a).unwrap()),
                    serde_json::to_string(&cfg.health_check).unwrap(),
                    serde_json::to_string(&cfg.rate_limits).unwrap(),
                    serde_json::to_string(&cfg.metadata).unwrap(),
                    cfg.group_id.as_ref().map(|g| g.as_ref()),
                    cfg.enabled,
                    now,
                ],
            )
        });

        match result {
            Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::Conflict(format!(
                    "server '{}' already exists",
                    cfg.name
                )))
            }
            other => other.map(|_| ()),
        }
    }

    pub fn update(&self, cfg: &ServerConfig) -> StorageResult<()> {
        let now = time::to_sql(Utc::now());
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE servers SET
                 name = ?2, transport = ?3, auth = ?4, health_check = ?5,
                 rate_limits = ?6, metadata = ?7, group_id = ?8, enabled = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    cfg.id.as_ref(),
                    cfg.name,
                    serde_json::to_string(&cfg.transport).unwrap(),
                    cfg.auth.as_ref().map(|a| serde_json::to_string(a).unwrap()),
                    serde_json::to_string(&cfg.health_check).unwrap(),
                    serde_json::to_string(&cfg.rate_limits).unwrap(),
                    serde_json::to_string(&cfg.metadata).unwrap(),
                    cfg.group_id.as_ref().map(|g| g.as_ref()),
                    cfg.enabled,
                    now,
                ],
            )
        })?;

        if changed == 0 {
            return Err(StorageError::NotFound(format!("server {}", cfg.id)));
        }
        Ok(())
    }

    pub fn get(&self, id: &ServerId) -> StorageResult<Option<ServerConfig>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, transport, auth, health_check, rate_limits, metadata, group_id, enabled
                 FROM servers WHERE id = ?1",
                [id.as_ref()],
                row_to_server,
            )
            .optional()
        })
    }

    pub fn get_by_name(&self, name: &str) -> StorageResult<Option<ServerConfig>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, transport, auth, health_check, rate_limits, metadata, group_id, enabled
                 FROM servers WHERE name = ?1",
                [name],
                row_to_server,
            )
            .optional()
        })
    }

    pub fn list(&self) -> StorageResult<Vec<ServerConfig>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, transport, auth, health_check, rate_limits, metadata, group_id, enabled
                 FROM servers ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_server)?;
            rows.collect()
        })
    }

    /// Deletes the server row; the caller tears down runtime
    /// registrations and embedding rows (it knows the entity ids).
    pub fn delete(&self, id: &ServerId) -> StorageResult<bool> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM servers WHERE id = ?1", [id.as_ref()]))?;
        Ok(deleted > 0)
    }

    pub fn insert_group(&self, group: &ServerGroup) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO server_groups (id, name, description) VALUES (?1, ?2, ?3)",
                params![group.id.as_ref(), group.name, group.description],
            )
        })?;
        Ok(())
    }

    pub fn list_groups(&self) -> StorageResult<Vec<ServerGroup>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, description FROM server_groups ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok(ServerGroup {
                    id: parse_id::<GroupId>(row, 0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }
}

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<ServerConfig> {
    let transport: String = row.get(2)?;
    let auth: Option<String> = row.get(3)?;
    let health_check: String = row.get(4)?;
    let rate_limits: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let group_id: Option<String> = row.get(7)?;

    Ok(ServerConfig {
        id: parse_id(row, 0)?,
        name: row.get(1)?,
        transport: serde_json::from_str(&transport).map_err(|e| json_err(2, e))?,
        auth: auth
            .map(|raw| serde_json::from_str(&raw).map_err(|e| json_err(3, e)))
            .transpose()?,
        health_check: serde_json::from_str(&health_check).map_err(|e| json_err(4, e))?,
        rate_limits: serde_json::from_str(&rate_limits).map_err(|e| json_err(5, e))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| json_err(6, e))?,
        group_id: group_id
            .map(|raw| GroupId::new(raw).map_err(|e| id_err(7, e)))
            .transpose()?,
        enabled: row.get(8)?,
    })
}

pub(crate) fn parse_id<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
}

pub(crate) fn json_err(idx: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn id_err(idx: usize, err: toolgrid_types::IdError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;
    use toolgrid_types::TransportConfig;

    fn store() -> ServerStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        ServerStore::new(db)
    }

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            id: ServerId::generate(),
            name: name.to_string(),
            transport: TransportConfig::Http {
                url: "http://localhost:4000".to_string(),
                headers: Default::default(),
            },
            auth: None,
            health_check: Default::default(),
            rate_limits: Default::default(),
            metadata: Default::default(),
            group_id: None,
            enabled: true,
        }
    }

    #[test]
    fn crud_roundtrip() {
        let store = store();
        let mut cfg = server("weather");
        store.insert(&cfg).unwrap();

        let loaded = store.get(&cfg.id).unwrap().unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(store.get_by_name("weather").unwrap().unwrap().id, cfg.id);

        cfg.enabled = false;
        store.update(&cfg).unwrap();
        assert!(!store.get(&cfg.id).unwrap().unwrap().enabled);

        assert!(store.delete(&cfg.id).unwrap());
        assert!(store.get(&cfg.id).unwrap().is_none());
        assert!(!store.delete(&cfg.id).unwrap());
    }

    #[test]
    fn duplicate_name_conflicts() {
        let store = store();
        store.insert(&server("weather")).unwrap();
        assert!(matches!(
            store.insert(&server("weather")),
            Err(StorageError::Conflict(_))
        ));
    }
}
