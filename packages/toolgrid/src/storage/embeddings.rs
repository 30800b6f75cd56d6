use chrono::Utc;
use rusqlite::params;
use toolgrid_types::EntityType;

use super::db::{time, Db, StorageResult};

/// One persisted embedding row; vectors are stored as JSON arrays, small
/// enough at this scale that a dedicated vector store is not warranted.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub embedding: Vec<f32>,
    pub model: String,
}

#[derive(Clone)]
pub struct EmbeddingStore {
    db: Db,
}

impl EmbeddingStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn upsert(&self, row: &EmbeddingRow) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO semantic_embeddings (entity_type, entity_id, embedding, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                 embedding = excluded.embedding, model = excluded.model, created_at = excluded.created_at",
                params![
                    row.entity_type.as_str(),
                    row.entity_id,
                    serde_json::to_string(&row.embedding).unwrap(),
                    row.model,
                    time::to_sql(Utc::now()),
                ],
            )
        })?;
        Ok(())
    }

    pub fn all_of_types(&self, types: &[EntityType]) -> StorageResult<Vec<EmbeddingRow>> {
        let all = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, entity_id, embedding, model FROM semantic_embeddings",
            )?;
            let rows = stmt.query_map([], |row| {
                let entity_type: String = row.get(0)?;
                let embedding: String = row.get(2)?;
                Ok((
                    entity_type,
                    row.get::<_, String>(1)?,
                    embedding,
                    row.get::<_, String>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(all
            .into_iter()
            .filter_map(|(entity_type, entity_id, embedding, model)| {
                let entity_type: EntityType = entity_type.parse().ok()?;
                if !types.is_empty() && !types.contains(&entity_type) {
                    return None;
                }
                let embedding: Vec<f32> = serde_json::from_str(&embedding).ok()?;
                Some(EmbeddingRow {
                    entity_type,
                    entity_id,
                    embedding,
                    model,
                })
            })
            .collect())
    }

    pub fn remove_entity(&self, entity_type: EntityType, entity_id: &str) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM semantic_embeddings WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type.as_str(), entity_id],
            )
        })?;
        Ok(())
    }

    pub fn clear(&self) -> StorageResult<()> {
        self.db
            .with_conn(|conn| conn.execute("DELETE FROM semantic_embeddings", []))?;
        Ok(())
    }

    pub fn count(&self) -> StorageResult<u64> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM semantic_embeddings", [], |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;

    #[test]
    fn upsert_and_filter_by_type() {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        let store = EmbeddingStore::new(db);

        store
            .upsert(&EmbeddingRow {
                entity_type: EntityType::Tool,
                entity_id: "weather/current".to_string(),
                embedding: vec![0.1, 0.2],
                model: "embed-small".to_string(),
            })
            .unwrap();
        store
            .upsert(&EmbeddingRow {
                entity_type: EntityType::Prompt,
                entity_id: "summary/daily".to_string(),
                embedding: vec![0.3, 0.4],
                model: "embed-small".to_string(),
            })
            .unwrap();

        assert_eq!(store.count().unwrap(), 2);
        let tools = store.all_of_types(&[EntityType::Tool]).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].entity_id, "weather/current");

        // upsert replaces in place
        store
            .upsert(&EmbeddingRow {
                entity_type: EntityType::Tool,
                entity_id: "weather/current".to_string(),
                embedding: vec![0.9, 0.9],
                model: "embed-small".to_string(),
            })
            .unwrap();
        assert_eq!(store.count().unwrap(), 2);

        store.remove_entity(EntityType::Tool, "weather/current").unwrap();
        assert_eq!(store.count().unwrap(), 1);
        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }
}
