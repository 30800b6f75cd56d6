use chrono::{Duration, Utc};
use rusqlite::{params_from_iter, Row};
use toolgrid_types::{UsageBucket, UsageQuery, UsageRecord, UsageSummary};

use super::audit::csv_escape;
use super::db::{time, Db, StorageError, StorageResult};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

/// Usage rows must survive at least a week for billing reconciliation.
pub const MIN_RETENTION_DAYS: u32 = 7;

#[derive(Clone)]
pub struct UsageStore {
    db: Db,
}

impl UsageStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn append(&self, record: &UsageRecord) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_metrics
                 (id, api_key_id, tenant_id, server_id, tool_name, action_type, count,
                  tokens_used, cost_credits, duration_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    record.id,
                    record.api_key_id.as_ref(),
                    record.tenant_id.as_ref().map(|t| t.as_ref()),
                    record.server_id.as_ref().map(|s| s.as_ref()),
                    record.tool_name,
                    record.action_type,
                    record.count as i64,
                    record.tokens_used.map(|t| t as i64),
                    record.cost_credits,
                    record.duration_ms.map(|d| d as i64),
                    time::to_sql(record.timestamp),
                ],
            )
        })?;
        Ok(())
    }

    pub fn query(&self, query: &UsageQuery) -> StorageResult<Vec<UsageRecord>> {
        let (where_clause, args) = build_filters(query);
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let offset = query.offset.unwrap_or(0);

        let sql = format!(
            "SELECT id, api_key_id, tenant_id, server_id, tool_name, action_type, count,
                    tokens_used, cost_credits, duration_ms, timestamp
             FROM usage_metrics {where_clause}
             ORDER BY timestamp DESC LIMIT {limit} OFFSET {offset}"
        );

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_record)?;
            rows.collect()
        })
    }

    pub fn summary(&self, query: &UsageQuery) -> StorageResult<UsageSummary> {
        let (where_clause, args) = build_filters(query);

        let totals_sql = format!(
            "SELECT COALESCE(SUM(count), 0), COALESCE(SUM(tokens_used), 0),
                    COALESCE(SUM(cost_credits), 0)
             FROM usage_metrics {where_clause}"
        );
        let by_server_sql = format!(
            "SELECT COALESCE(server_id, '(none)'), COALESCE(SUM(count), 0),
                    COALESCE(SUM(tokens_used), 0), COALESCE(SUM(cost_credits), 0)
             FROM usage_metrics {where_clause}
             GROUP BY server_id ORDER BY SUM(count) DESC"
        );
        let by_action_sql = format!(
            "SELECT action_type, COALESCE(SUM(count), 0),
                    COALESCE(SUM(tokens_used), 0), COALESCE(SUM(cost_credits), 0)
             FROM usage_metrics {where_clause}
             GROUP BY action_type ORDER BY SUM(count) DESC"
        );

        self.db.with_conn(|conn| {
            let (total_calls, total_tokens, total_cost) =
                conn.query_row(&totals_sql, params_from_iter(args.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, f64>(2)?,
                    ))
                })?;

            let mut by_server = Vec::new();
            {
                let mut stmt = conn.prepare(&by_server_sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), row_to_bucket)?;
                for row in rows {
                    by_server.push(row?);
                }
            }

            let mut by_action = Vec::new();
            {
                let mut stmt = conn.prepare(&by_action_sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), row_to_bucket)?;
                for row in rows {
                    by_action.push(row?);
                }
            }

            Ok(UsageSummary {
                total_calls,
                total_tokens,
                total_cost_credits: total_cost,
                by_server,
                by_action,
            })
        })
    }

    pub fn export_csv(&self, query: &UsageQuery) -> StorageResult<String> {
        let records = self.query(query)?;
        let mut out = String::from(
            "id,api_key_id,tenant_id,server_id,tool_name,action_type,count,tokens_used,cost_credits,duration_ms,timestamp\n",
        );
        for r in records {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{}\n",
                r.id,
                r.api_key_id,
                r.tenant_id.as_ref().map(|t| t.to_string()).unwrap_or_default(),
                r.server_id.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                r.tool_name.as_deref().map(csv_escape).unwrap_or_default(),
                csv_escape(&r.action_type),
                r.count,
                r.tokens_used.map(|t| t.to_string()).unwrap_or_default(),
                r.cost_credits.map(|c| c.to_string()).unwrap_or_default(),
                r.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                r.timestamp.to_rfc3339(),
            ));
        }
        Ok(out)
    }

    pub fn cleanup(&self, older_than_days: u32) -> StorageResult<u64> {
        if older_than_days < MIN_RETENTION_DAYS {
            return Err(StorageError::Retention(format!(
                "usage retention must be at least {MIN_RETENTION_DAYS} days"
            )));
        }
        let cutoff = Utc::now() - Duration::days(older_than_days as i64);
        let deleted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM usage_metrics WHERE timestamp < ?1",
                [time::to_sql(cutoff)],
            )
        })?;
        Ok(deleted as u64)
    }
}

fn build_filters(query: &UsageQuery) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(api_key_id) = &query.api_key_id {
        args.push(api_key_id.to_string());
        clauses.push(format!("api_key_id = ?{}", args.len()));
    }
    if let Some(tenant_id) = &query.tenant_id {
        args.push(tenant_id.to_string());
        clauses.push(format!("tenant_id = ?{}", args.len()));
    }
    if let Some(server_id) = &query.server_id {
        args.push(server_id.to_string());
        clauses.push(format!("server_id = ?{}", args.len()));
    }
    if let Some(action_type) = &query.action_type {
        args.push(action_type.clone());
        clauses.push(format!("action_type = ?{}", args.len()));
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

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    use super::servers::parse_id;

    Ok(UsageRecord {
        id: row.get(0)?,
        api_key_id: parse_id(row, 1)?,
        tenant_id: row
            .get::<_, Option<String>>(2)?
            .map(|_| parse_id(row, 2))
            .transpose()?,
        server_id: row
            .get::<_, Option<String>>(3)?
            .map(|_| parse_id(row, 3))
            .transpose()?,
        tool_name: row.get(4)?,
        action_type: row.get(5)?,
        count: row.get::<_, i64>(6)? as u64,
        tokens_used: row.get::<_, Option<i64>>(7)?.map(|t| t as u64),
        cost_credits: row.get(8)?,
        duration_ms: row.get::<_, Option<i64>>(9)?.map(|d| d as u64),
        timestamp: time::from_sql(&row.get::<_, String>(10)?),
    })
}

fn row_to_bucket(row: &Row<'_>) -> rusqlite::Result<UsageBucket> {
    Ok(UsageBucket {
        key: row.get(0)?,
        calls: row.get::<_, i64>(1)? as u64,
        tokens: row.get::<_, i64>(2)? as u64,
        cost_credits: row.get::<_, f64>(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;
    use toolgrid_types::{ApiKeyId, ServerId};

    fn store() -> UsageStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        UsageStore::new(db)
    }

    fn record(server: &str, action: &str, tokens: u64) -> UsageRecord {
        UsageRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            api_key_id: ApiKeyId::new("key-one").unwrap(),
            tenant_id: None,
            server_id: Some(ServerId::new(server).unwrap()),
            tool_name: Some("current".to_string()),
            action_type: action.to_string(),
            count: 1,
            tokens_used: Some(tokens),
            cost_credits: Some(0.1),
            duration_ms: Some(20),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn summary_buckets_by_server_and_action() {
        let store = store();
        store.append(&record("srv-a", "tool_call", 10)).unwrap();
        store.append(&record("srv-a", "tool_call", 20)).unwrap();
        store.append(&record("srv-b", "prompt_get", 5)).unwrap();

        let summary = store.summary(&UsageQuery::default()).unwrap();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_tokens, 35);
        assert_eq!(summary.by_server[0].key, "srv-a");
        assert_eq!(summary.by_server[0].tokens, 30);
        assert_eq!(summary.by_action.len(), 2);
    }

    #[test]
    fn minimum_retention_is_enforced() {
        let store = store();
        assert!(matches!(
            store.cleanup(3),
            Err(StorageError::Retention(_))
        ));
        assert_eq!(store.cleanup(7).unwrap(), 0);
    }
}
