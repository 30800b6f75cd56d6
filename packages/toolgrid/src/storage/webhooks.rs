use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use toolgrid_types::{
    DeliveryStats, DeliveryStatus, SubscriptionId, WebhookDelivery, WebhookSubscription,
};

use super::db::{time, Db, StorageError, StorageResult};
use super::servers::{json_err, parse_id};

#[derive(Clone)]
pub struct WebhookStore {
    db: Db,
}

impl WebhookStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert_subscription(&self, sub: &WebhookSubscription) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO webhook_subscriptions
                 (id, name, url, events, secret, enabled, server_filter,
                  retry_count, retry_delay_ms, timeout_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sub.id.as_ref(),
                    sub.name,
                    sub.url,
                    serde_json::to_string(&sub.events).unwrap(),
                    sub.secret,
                    sub.enabled,
                    serde_json::to_string(&sub.server_filter).unwrap(),
                    sub.retry_count,
                    sub.retry_delay_ms as i64,
                    sub.timeout_ms as i64,
                    time::to_sql(Utc::now()),
                ],
            )
        })?;
        Ok(())
    }

    pub fn update_subscription(&self, sub: &WebhookSubscription) -> StorageResult<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE webhook_subscriptions SET
                 name = ?2, url = ?3, events = ?4, secret = ?5, enabled = ?6,
                 server_filter = ?7, retry_count = ?8, retry_delay_ms = ?9, timeout_ms = ?10
                 WHERE id = ?1",
                params![
                    sub.id.as_ref(),
                    sub.name,
                    sub.url,
                    serde_json::to_string(&sub.events).unwrap(),
                    sub.secret,
                    sub.enabled,
                    serde_json::to_string(&sub.server_filter).unwrap(),
                    sub.retry_count,
                    sub.retry_delay_ms as i64,
                    sub.timeout_ms as i64,
                ],
            )
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("subscription {}", sub.id)));
        }
        Ok(())
    }

    pub fn delete_subscription(&self, id: &SubscriptionId) -> StorageResult<bool> {
        let deleted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM webhook_subscriptions WHERE id = ?1",
                [id.as_ref()],
            )
        })?;
        Ok(deleted > 0)
    }

    pub fn get_subscription(&self, id: &SubscriptionId) -> StorageResult<Option<WebhookSubscription>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, url, events, secret, enabled, server_filter,
                        retry_count, retry_delay_ms, timeout_ms
                 FROM webhook_subscriptions WHERE id = ?1",
                [id.as_ref()],
                row_to_subscription,
            )
            .optional()
        })
    }

    pub fn list_subscriptions(&self) -> StorageResult<Vec<WebhookSubscription>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, url, events, secret, enabled, server_filter,
                        retry_count, retry_delay_ms, timeout_ms
                 FROM webhook_subscriptions ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_subscription)?;
            rows.collect()
        })
    }

    pub fn enabled_subscriptions(&self) -> StorageResult<Vec<WebhookSubscription>> {
        Ok(self
            .list_subscriptions()?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    pub fn insert_delivery(&self, delivery: &WebhookDelivery) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO webhook_deliveries
                 (id, subscription_id, event, payload, status, status_code, response_body,
                  error, attempt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    delivery.id.as_ref(),
                    delivery.subscription_id.as_ref(),
                    delivery.event,
                    serde_json::to_string(&delivery.payload).unwrap(),
                    delivery.status.as_str(),
                    delivery.status_code,
                    delivery.response_body,
                    delivery.error,
                    delivery.attempt,
                    time::to_sql(delivery.created_at),
                ],
            )
        })?;
        Ok(())
    }

    pub fn update_delivery(&self, delivery: &WebhookDelivery) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE webhook_deliveries SET
                 status = ?2, status_code = ?3, response_body = ?4, error = ?5, attempt = ?6
                 WHERE id = ?1",
                params![
                    delivery.id.as_ref(),
                    delivery.status.as_str(),
                    delivery.status_code,
                    delivery.response_body,
                    delivery.error,
                    delivery.attempt,
                ],
            )
        })?;
        Ok(())
    }

    pub fn list_deliveries(
        &self,
        subscription_id: Option<&SubscriptionId>,
        limit: u32,
        offset: u32,
    ) -> StorageResult<Vec<WebhookDelivery>> {
        self.db.with_conn(|conn| match subscription_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, subscription_id, event, payload, status, status_code,
                            response_body, error, attempt, created_at
                     FROM webhook_deliveries WHERE subscription_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![id.as_ref(), limit, offset], row_to_delivery)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, subscription_id, event, payload, status, status_code,
                            response_body, error, attempt, created_at
                     FROM webhook_deliveries ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], row_to_delivery)?;
                rows.collect()
            }
        })
    }

    pub fn delivery_stats(&self) -> StorageResult<DeliveryStats> {
        self.db.with_conn(|conn| {
            let mut stats = DeliveryStats::default();
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM webhook_deliveries GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (status, count) = row?;
                stats.total += count;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "success" => stats.success = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }
}

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<WebhookSubscription> {
    let events: String = row.get(3)?;
    let server_filter: String = row.get(6)?;
    Ok(WebhookSubscription {
        id: parse_id(row, 0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        events: serde_json::from_str(&events).map_err(|e| json_err(3, e))?,
        secret: row.get(4)?,
        enabled: row.get(5)?,
        server_filter: serde_json::from_str(&server_filter).map_err(|e| json_err(6, e))?,
        retry_count: row.get(7)?,
        retry_delay_ms: row.get::<_, i64>(8)? as u64,
        timeout_ms: row.get::<_, i64>(9)? as u64,
    })
}

fn row_to_delivery(row: &Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    let payload: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(WebhookDelivery {
        id: parse_id(row, 0)?,
        subscription_id: parse_id(row, 1)?,
        event: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| json_err(3, e))?,
        status: status.parse().unwrap_or(DeliveryStatus::Failed),
        status_code: row.get(5)?,
        response_body: row.get(6)?,
        error: row.get(7)?,
        attempt: row.get(8)?,
        created_at: time::from_sql(&row.get::<_, String>(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;
    use serde_json::json;
    use toolgrid_types::DeliveryId;

    fn store() -> WebhookStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        WebhookStore::new(db)
    }

    fn subscription() -> WebhookSubscription {
        WebhookSubscription {
            id: SubscriptionId::generate(),
            name: "ops".to_string(),
            url: "http://localhost:9999/hook".to_string(),
            events: vec!["server.connected".to_string()],
            secret: Some("shh".to_string()),
            enabled: true,
            server_filter: Vec::new(),
            retry_count: 3,
            retry_delay_ms: 10,
            timeout_ms: 5000,
        }
    }

    #[test]
    fn subscription_crud() {
        let store = store();
        let mut sub = subscription();
        store.insert_subscription(&sub).unwrap();

        assert_eq!(store.list_subscriptions().unwrap().len(), 1);

        sub.enabled = false;
        store.update_subscription(&sub).unwrap();
        assert!(store.enabled_subscriptions().unwrap().is_empty());

        assert!(store.delete_subscription(&sub.id).unwrap());
        assert!(store.get_subscription(&sub.id).unwrap().is_none());
    }

    #[test]
    fn delivery_stats_aggregate_by_status() {
        let store = store();
        let sub = subscription();
        store.insert_subscription(&sub).unwrap();

        for (i, status) in [
            DeliveryStatus::Success,
            DeliveryStatus::Success,
            DeliveryStatus::Failed,
        ]
        .iter()
        .enumerate()
        {
            store
                .insert_delivery(&WebhookDelivery {
                    id: DeliveryId::generate(),
                    subscription_id: sub.id.clone(),
                    event: "server.connected".to_string(),
                    payload: json!({"n": i}),
                    status: *status,
                    status_code: Some(200),
                    response_body: None,
                    error: None,
                    attempt: 1,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let stats = store.delivery_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 1);
    }
}
