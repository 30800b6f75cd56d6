//! Forward-only schema migrations. Each migration runs in its own
//! transaction and is recorded in `schema_migrations`; startup applies
//! whatever is pending and refuses to go backwards.

use rusqlite::Transaction;

use super::db::{Db, StorageError, StorageResult};

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: fn(&Transaction) -> rusqlite::Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "servers_and_api_keys",
        up: v1_servers_and_api_keys,
    },
    Migration {
        version: 2,
        name: "workflows_and_executions",
        up: v2_workflows_and_executions,
    },
    Migration {
        version: 3,
        name: "webhooks",
        up: v3_webhooks,
    },
    Migration {
        version: 4,
        name: "audit_and_usage",
        up: v4_audit_and_usage,
    },
    Migration {
        version: 5,
        name: "budgets",
        up: v5_budgets,
    },
    Migration {
        version: 6,
        name: "rbac_embeddings_key_scanning",
        up: v6_rbac_embeddings_key_scanning,
    },
];

/// Applies pending migrations; returns how many ran.
pub fn apply(db: &Db) -> StorageResult<usize> {
    db.with_conn(|conn| {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )
    })?;

    let current: i64 = db.with_conn(|conn| {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
    })?;

    let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current > latest {
        return Err(StorageError::Conflict(format!(
            "database schema version {current} is newer than this binary supports ({latest})"
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        db.with_tx(|tx| {
            (migration.up)(tx)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.name,
                    chrono::Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied migration"
        );
        applied += 1;
    }

    Ok(applied)
}

pub fn current_version(db: &Db) -> StorageResult<i64> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
    })
}

fn v1_servers_and_api_keys(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE server_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        );

        CREATE TABLE servers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            transport TEXT NOT NULL,
            auth TEXT,
            health_check TEXT NOT NULL,
            rate_limits TEXT NOT NULL,
            metadata TEXT NOT NULL,
            group_id TEXT REFERENCES server_groups(id) ON DELETE SET NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE api_keys (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            tenant_id TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            last_used_at TEXT
        );

        CREATE INDEX idx_servers_group ON servers(group_id);
        "#,
    )
}

fn v2_workflows_and_executions(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE workflows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            definition TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE workflow_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            definition TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE workflow_executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            input TEXT NOT NULL,
            output TEXT,
            error TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            triggered_by TEXT,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost_credits REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE workflow_execution_steps (
            execution_id TEXT NOT NULL REFERENCES workflow_executions(id) ON DELETE CASCADE,
            step_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            input TEXT,
            output TEXT,
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost_credits REAL NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (execution_id, step_index)
        );

        CREATE INDEX idx_executions_workflow ON workflow_executions(workflow_id, started_at);
        CREATE INDEX idx_executions_status ON workflow_executions(status);
        "#,
    )
}

fn v3_webhooks(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE webhook_subscriptions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            events TEXT NOT NULL,
            secret TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            server_filter TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 3,
            retry_delay_ms INTEGER NOT NULL DEFAULT 1000,
            timeout_ms INTEGER NOT NULL DEFAULT 10000,
            created_at TEXT NOT NULL
        );

        CREATE TABLE webhook_deliveries (
            id TEXT PRIMARY KEY,
            subscription_id TEXT NOT NULL REFERENCES webhook_subscriptions(id) ON DELETE CASCADE,
            event TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            status_code INTEGER,
            response_body TEXT,
            error TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_deliveries_subscription ON webhook_deliveries(subscription_id, created_at);
        CREATE INDEX idx_deliveries_status ON webhook_deliveries(status);
        "#,
    )
}

fn v4_audit_and_usage(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE audit_log (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT,
            api_key_id TEXT,
            tenant_id TEXT,
            ip_address TEXT,
            user_agent TEXT,
            duration_ms INTEGER,
            success INTEGER NOT NULL,
            details TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE usage_metrics (
            id TEXT PRIMARY KEY,
            api_key_id TEXT NOT NULL,
            tenant_id TEXT,
            server_id TEXT,
            tool_name TEXT,
            action_type TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 1,
            tokens_used INTEGER,
            cost_credits REAL,
            duration_ms INTEGER,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX idx_audit_timestamp ON audit_log(timestamp);
        CREATE INDEX idx_audit_action ON audit_log(action, timestamp);
        CREATE INDEX idx_usage_timestamp ON usage_metrics(timestamp);
        CREATE INDEX idx_usage_key ON usage_metrics(api_key_id, timestamp);
        "#,
    )
}

fn v5_budgets(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE cost_budgets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scope TEXT NOT NULL,
            scope_id TEXT,
            budget_credits REAL NOT NULL,
            period TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT,
            current_spend REAL NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            enforce_limit INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE budget_alerts (
            budget_id TEXT NOT NULL REFERENCES cost_budgets(id) ON DELETE CASCADE,
            threshold_percent INTEGER NOT NULL,
            triggered INTEGER NOT NULL DEFAULT 0,
            triggered_at TEXT,
            PRIMARY KEY (budget_id, threshold_percent)
        );

        CREATE TABLE budget_violations (
            id TEXT PRIMARY KEY,
            budget_id TEXT NOT NULL REFERENCES cost_budgets(id) ON DELETE CASCADE,
            workflow_id TEXT,
            spend REAL NOT NULL,
            limit_credits REAL NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX idx_budget_scope
            ON cost_budgets(scope, COALESCE(scope_id, ''), period)
            WHERE enabled = 1;
        "#,
    )
}

fn v6_rbac_embeddings_key_scanning(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE rbac_permissions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        );

        CREATE TABLE rbac_roles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        );

        CREATE TABLE rbac_role_permissions (
            role_id TEXT NOT NULL REFERENCES rbac_roles(id) ON DELETE CASCADE,
            permission_id TEXT NOT NULL REFERENCES rbac_permissions(id) ON DELETE CASCADE,
            PRIMARY KEY (role_id, permission_id)
        );

        CREATE TABLE rbac_api_key_roles (
            api_key_id TEXT NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
            role_id TEXT NOT NULL REFERENCES rbac_roles(id) ON DELETE CASCADE,
            PRIMARY KEY (api_key_id, role_id)
        );

        CREATE TABLE semantic_embeddings (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            embedding TEXT NOT NULL,
            model TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );

        CREATE TABLE key_patterns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            pattern TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE key_exposure_detections (
            id TEXT PRIMARY KEY,
            pattern_id TEXT NOT NULL REFERENCES key_patterns(id) ON DELETE CASCADE,
            location TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_once_and_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let applied = apply(&db).unwrap();
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&db).unwrap(), MIGRATIONS.len() as i64);

        // a second run applies nothing
        assert_eq!(apply(&db).unwrap(), 0);
    }

    #[test]
    fn refuses_newer_schema() {
        let db = Db::open_in_memory().unwrap();
        apply(&db).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (999, 'future', '2030-01-01T00:00:00Z')",
                [],
            )
        })
        .unwrap();

        assert!(matches!(apply(&db), Err(StorageError::Conflict(_))));
    }

    #[test]
    fn required_tables_exist() {
        let db = Db::open_in_memory().unwrap();
        apply(&db).unwrap();

        for table in [
            "servers",
            "server_groups",
            "api_keys",
            "workflows",
            "workflow_executions",
            "workflow_execution_steps",
            "workflow_templates",
            "webhook_subscriptions",
            "webhook_deliveries",
            "audit_log",
            "usage_metrics",
            "cost_budgets",
            "budget_alerts",
            "budget_violations",
            "rbac_permissions",
            "rbac_roles",
            "rbac_role_permissions",
            "rbac_api_key_roles",
            "semantic_embeddings",
            "key_patterns",
            "key_exposure_detections",
            "schema_migrations",
        ] {
            let count: i64 = db
                .with_conn(|conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                        [table],
                        |row| row.get(0),
                    )
                })
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
