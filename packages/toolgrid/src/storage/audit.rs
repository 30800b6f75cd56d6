use chrono::{Duration, Utc};
use rusqlite::{params_from_iter, Row};
use toolgrid_types::{AuditEntry, AuditQuery};

use super::db::{time, Db, StorageError, StorageResult};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

/// Append-only audit trail. Rows are inserted and purged, never updated;
/// there is deliberately no update method here.
#[derive(Clone)]
pub struct AuditStore {
    db: Db,
}

impl AuditStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn append(&self, entry: &AuditEntry) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                 (id, timestamp, action, resource_type, resource_id, api_key_id, tenant_id,
                  ip_address, user_agent, duration_ms, success, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    entry.id,
                    time::to_sql(entry.timestamp),
                    entry.action,
                    entry.resource_type,
                    entry.resource_id,
                    entry.api_key_id.as_ref().map(|k| k.as_ref()),
                    entry.tenant_id.as_ref().map(|t| t.as_ref()),
                    entry.ip_address,
                    entry.user_agent,
                    entry.duration_ms.map(|d| d as i64),
                    entry.success,
                    serde_json::to_string(&entry.details).unwrap(),
                ],
            )
        })?;
        Ok(())
    }

    pub fn query(&self, query: &AuditQuery) -> StorageResult<Vec<AuditEntry>> {
        let (where_clause, args) = build_filters(query);
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let offset = query.offset.unwrap_or(0);

        let sql = format!(
            "SELECT id, timestamp, action, resource_type, resource_id, api_key_id, tenant_id,
                    ip_address, user_agent, duration_ms, success, details
             FROM audit_log {where_clause}
             ORDER BY timestamp DESC LIMIT {limit} OFFSET {offset}"
        );

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_entry)?;
            rows.collect()
        })
    }

    pub fn count(&self, query: &AuditQuery) -> StorageResult<u64> {
        let (where_clause, args) = build_filters(query);
        let sql = format!("SELECT COUNT(*) FROM audit_log {where_clause}");
        self.db.with_conn(|conn| {
            conn.query_row(&sql, params_from_iter(args.iter()), |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
        })
    }

    pub fn export_json(&self, query: &AuditQuery) -> StorageResult<String> {
        let entries = self.query(query)?;
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn export_csv(&self, query: &AuditQuery) -> StorageResult<String> {
        let entries = self.query(query)?;
        let mut out = String::from(
            "id,timestamp,action,resource_type,resource_id,api_key_id,tenant_id,success,duration_ms\n",
        );
        for entry in entries {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{}\n",
                entry.id,
                entry.timestamp.to_rfc3339(),
                csv_escape(&entry.action),
                csv_escape(&entry.resource_type),
                entry.resource_id.as_deref().map(csv_escape).unwrap_or_default(),
                entry.api_key_id.as_ref().map(|k| k.to_string()).unwrap_or_default(),
                entry.tenant_id.as_ref().map(|t| t.to_string()).unwrap_or_default(),
                entry.success,
                entry.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
            ));
        }
        Ok(out)
    }

    /// Purges rows older than the given horizon. Retention cannot go
    /// below one day.
    pub fn cleanup(&self, older_than_days: u32) -> StorageResult<u64> {
        if older_than_days < 1 {
            return Err(StorageError::Retention(
                "audit retention must be at least 1 day".to_string(),
            ));
        }
        let cutoff = Utc::now() - Duration::days(older_than_days as i64);
        let deleted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM audit_log WHERE timestamp < ?1",
                [time::to_sql(cutoff)],
            )
        })?;
        Ok(deleted as u64)
    }
}

pub(crate) fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn build_filters(query: &AuditQuery) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(action) = &query.action {
        args.push(action.clone());
        clauses.push(format!("action = ?{}", args.len()));
    }
    if let Some(resource_type) = &query.resource_type {
        args.push(resource_type.clone());
        clauses.push(format!("resource_type = ?{}", args.len()));
    }
    if let Some(api_key_id) = &query.api_key_id {
        args.push(api_key_id.to_string());
        clauses.push(format!("api_key_id = ?{}", args.len()));
    }
    if let Some(tenant_id) = &query.tenant_id {
        args.push(tenant_id.to_string());
        clauses.push(format!("tenant_id = ?{}", args.len()));
    }
    if let Some(success) = query.success {
        args.push(if success { "1" } else { "0" }.to_string());
        clauses.push(format!("success = ?{}", args.len()));
    }
    if let Some(from) = query.from {
        args.push(time::to_sql(from));
        clauses.push(format!("timestamp >= ?{}", args.len()));
    }
    if let Some(to) = query.to {
        args.push(time::to_sql(to));
        clauses.push(format!("timestamp <= ?{}", args.len()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    use super::servers::{json_err, parse_id};

    let details: String = row.get(11)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: time::from_sql(&row.get::<_, String>(1)?),
        action: row.get(2)?,
        resource_type: row.get(3)?,
        resource_id: row.get(4)?,
        api_key_id: row
            .get::<_, Option<String>>(5)?
            .map(|_| parse_id(row, 5))
            .transpose()?,
        tenant_id: row
            .get::<_, Option<String>>(6)?
            .map(|_| parse_id(row, 6))
            .transpose()?,
        ip_address: row.get(7)?,
        user_agent: row.get(8)?,
        duration_ms: row.get::<_, Option<i64>>(9)?.map(|d| d as u64),
        success: row.get(10)?,
        details: serde_json::from_str(&details).map_err(|e| json_err(11, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;
    use serde_json::json;

    fn store() -> AuditStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        AuditStore::new(db)
    }

    fn entry(action: &str, success: bool) -> AuditEntry {
        AuditEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            action: action.to_string(),
            resource_type: "tool".to_string(),
            resource_id: Some("weather/current".to_string()),
            api_key_id: None,
            tenant_id: None,
            ip_address: Some("127.0.0.1".to_string()),
            user_agent: None,
            duration_ms: Some(12),
            success,
            details: json!({"note": "test"}),
        }
    }

    #[test]
    fn query_filters_compound() {
        let store = store();
        store.append(&entry("tool.invoke", true)).unwrap();
        store.append(&entry("tool.invoke", false)).unwrap();
        store.append(&entry("server.create", true)).unwrap();

        let hits = store
            .query(&AuditQuery {
                action: Some("tool.invoke".to_string()),
                success: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            store
                .count(&AuditQuery {
                    action: Some("tool.invoke".to_string()),
                    ..Default::default()
                })
                .unwrap(),
            2
        );
    }

    #[test]
    fn csv_export_escapes_fields() {
        let store = store();
        let mut e = entry("tool.invoke", true);
        e.action = "weird,\"action\"".to_string();
        store.append(&e).unwrap();

        let csv = store.export_csv(&AuditQuery::default()).unwrap();
        assert!(csv.contains("\"weird,\"\"action\"\"\""));
    }

    #[test]
    fn cleanup_enforces_minimum_retention() {
        let store = store();
        assert!(matches!(
            store.cleanup(0),
            Err(StorageError::Retention(_))
        ));

        store.append(&entry("old", true)).unwrap();
        // nothing is old enough to purge
        assert_eq!(store.cleanup(1).unwrap(), 0);
    }
}
