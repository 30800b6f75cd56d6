use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use toolgrid_types::{Workflow, WorkflowDefinition, WorkflowId};

use super::db::{time, Db, StorageError, StorageResult};
use super::servers::{json_err, parse_id};

#[derive(Clone)]
pub struct WorkflowStore {
    db: Db,
}

impl WorkflowStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert(&self, name: &str, definition: &WorkflowDefinition) -> StorageResult<Workflow> {
        let workflow = Workflow {
            id: WorkflowId::generate(),
            name: name.to_string(),
            definition: definition.clone(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflows (id, name, definition, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    workflow.id.as_ref(),
                    workflow.name,
                    serde_json::to_string(&workflow.definition).unwrap(),
                    workflow.enabled,
                    time::to_sql(workflow.created_at),
                    time::to_sql(workflow.updated_at),
                ],
            )
        });

        match result {
            Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::Conflict(format!(
                    "workflow '{name}' already exists"
                )))
            }
            Err(other) => Err(other),
            Ok(_) => Ok(workflow),
        }
    }

    pub fn update(
        &self,
        id: &WorkflowId,
        name: Option<&str>,
        definition: Option<&WorkflowDefinition>,
        enabled: Option<bool>,
    ) -> StorageResult<Workflow> {
        let mut workflow = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("workflow {id}")))?;

        if let Some(name) = name {
            workflow.name = name.to_string();
        }
        if let Some(definition) = definition {
            workflow.definition = definition.clone();
        }
        if let Some(enabled) = enabled {
            workflow.enabled = enabled;
        }
        workflow.updated_at = Utc::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflows SET name = ?2, definition = ?3, enabled = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    workflow.id.as_ref(),
                    workflow.name,
                    serde_json::to_string(&workflow.definition).unwrap(),
                    workflow.enabled,
                    time::to_sql(workflow.updated_at),
                ],
            )
        })?;

        Ok(workflow)
    }

    pub fn set_enabled(&self, id: &WorkflowId, enabled: bool) -> StorageResult<bool> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflows SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_ref(), enabled, time::to_sql(Utc::now())],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &WorkflowId) -> StorageResult<Option<Workflow>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, definition, enabled, created_at, updated_at
                 FROM workflows WHERE id = ?1",
                [id.as_ref()],
                row_to_workflow,
            )
            .optional()
        })
    }

    pub fn list(&self) -> StorageResult<Vec<Workflow>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, definition, enabled, created_at, updated_at
                 FROM workflows ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_workflow)?;
            rows.collect()
        })
    }

    /// Cascades execution rows through the FK.
    pub fn delete(&self, id: &WorkflowId) -> StorageResult<bool> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM workflows WHERE id = ?1", [id.as_ref()]))?;
        Ok(deleted > 0)
    }
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    let definition: String = row.get(2)?;
    Ok(Workflow {
        id: parse_id(row, 0)?,
        name: row.get(1)?,
        definition: serde_json::from_str(&definition).map_err(|e| json_err(2, e))?,
        enabled: row.get(3)?,
        created_at: time::from_sql(&row.get::<_, String>(4)?),
        updated_at: time::from_sql(&row.get::<_, String>(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;
    use toolgrid_types::ErrorHandling;

    fn store() -> WorkflowStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        WorkflowStore::new(db)
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "daily".to_string(),
            description: Some("daily report".to_string()),
            steps: Vec::new(),
            error_handling: ErrorHandling::default(),
            timeout_ms: None,
        }
    }

    #[test]
    fn definition_roundtrips_through_storage() {
        let store = store();
        let created = store.insert("daily", &definition()).unwrap();

        let loaded = store.get(&created.id).unwrap().unwrap();
        assert_eq!(loaded.definition, created.definition);
        assert_eq!(loaded.name, "daily");

        let updated = store
            .update(&created.id, Some("nightly"), None, Some(false))
            .unwrap();
        assert_eq!(updated.name, "nightly");
        assert!(!updated.enabled);

        assert!(store.delete(&created.id).unwrap());
        assert!(store.get(&created.id).unwrap().is_none());
    }
}
