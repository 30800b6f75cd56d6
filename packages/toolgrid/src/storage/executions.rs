use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use toolgrid_types::{
    ExecutionId, ExecutionStatus, ExecutionStep, StepStatus, WorkflowExecution, WorkflowId,
};

use super::db::{time, Db, StorageError, StorageResult};
use super::servers::{json_err, parse_id};

#[derive(Clone)]
pub struct ExecutionStore {
    db: Db,
}

impl ExecutionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert(
        &self,
        workflow_id: &WorkflowId,
        input: &serde_json::Value,
        triggered_by: Option<&str>,
    ) -> StorageResult<WorkflowExecution> {
        let execution = WorkflowExecution {
            id: ExecutionId::generate(),
            workflow_id: workflow_id.clone(),
            status: ExecutionStatus::Pending,
            input: input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            triggered_by: triggered_by.map(str::to_string),
            tokens_used: 0,
            cost_credits: 0.0,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_executions
                 (id, workflow_id, status, input, started_at, triggered_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    execution.id.as_ref(),
                    execution.workflow_id.as_ref(),
                    execution.status.as_str(),
                    serde_json::to_string(&execution.input).unwrap(),
                    time::to_sql(execution.started_at),
                    execution.triggered_by,
                ],
            )
        })?;

        Ok(execution)
    }

    pub fn set_status(&self, id: &ExecutionId, status: ExecutionStatus) -> StorageResult<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_executions SET status = ?2 WHERE id = ?1",
                params![id.as_ref(), status.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("execution {id}")));
        }
        Ok(())
    }

    pub fn finish(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
        tokens_used: u64,
        cost_credits: f64,
    ) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_executions SET
                 status = ?2, output = ?3, error = ?4, completed_at = ?5,
                 tokens_used = ?6, cost_credits = ?7
                 WHERE id = ?1",
                params![
                    id.as_ref(),
                    status.as_str(),
                    output.map(|o| serde_json::to_string(o).unwrap()),
                    error,
                    time::to_sql(Utc::now()),
                    tokens_used as i64,
                    cost_credits,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, id: &ExecutionId) -> StorageResult<Option<WorkflowExecution>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, workflow_id, status, input, output, error, started_at, completed_at,
                        triggered_by, tokens_used, cost_credits
                 FROM workflow_executions WHERE id = ?1",
                [id.as_ref()],
                row_to_execution,
            )
            .optional()
        })
    }

    pub fn list(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: u32,
        offset: u32,
    ) -> StorageResult<Vec<WorkflowExecution>> {
        self.db.with_conn(|conn| {
            match workflow_id {
                Some(workflow_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, workflow_id, status, input, output, error, started_at,
                                completed_at, triggered_by, tokens_used, cost_credits
                         FROM workflow_executions WHERE workflow_id = ?1
                         ORDER BY started_at DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let rows =
                        stmt.query_map(params![workflow_id.as_ref(), limit, offset], row_to_execution)?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, workflow_id, status, input, output, error, started_at,
                                completed_at, triggered_by, tokens_used, cost_credits
                         FROM workflow_executions
                         ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let rows = stmt.query_map(params![limit, offset], row_to_execution)?;
                    rows.collect()
                }
            }
        })
    }

    /// Upserts one step row keyed by (execution, index). The engine calls
    /// this before the next step starts.
    pub fn upsert_step(&self, step: &ExecutionStep) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_execution_steps
                 (execution_id, step_index, name, status, input, output, error, retry_count,
                  started_at, completed_at, tokens_used, cost_credits, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (execution_id, step_index) DO UPDATE SET
                 status = excluded.status, input = excluded.input, output = excluded.output,
                 error = excluded.error, retry_count = excluded.retry_count,
                 completed_at = excluded.completed_at, tokens_used = excluded.tokens_used,
                 cost_credits = excluded.cost_credits, duration_ms = excluded.duration_ms",
                params![
                    step.execution_id.as_ref(),
                    step.index,
                    step.name,
                    step.status.as_str(),
                    step.input
                        .as_ref()
                        .map(|v| serde_json::to_string(v).unwrap()),
                    step.output
                        .as_ref()
                        .map(|v| serde_json::to_string(v).unwrap()),
                    step.error,
                    step.retry_count,
                    time::to_sql(step.started_at),
                    time::opt_to_sql(step.completed_at),
                    step.tokens_used as i64,
                    step.cost_credits,
                    step.duration_ms as i64,
                ],
            )
        })?;
        Ok(())
    }

    pub fn steps(&self, execution_id: &ExecutionId) -> StorageResult<Vec<ExecutionStep>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT execution_id, step_index, name, status, input, output, error, retry_count,
                        started_at, completed_at, tokens_used, cost_credits, duration_ms
                 FROM workflow_execution_steps WHERE execution_id = ?1 ORDER BY step_index",
            )?;
            let rows = stmt.query_map([execution_id.as_ref()], row_to_step)?;
            rows.collect()
        })
    }
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<WorkflowExecution> {
    let status: String = row.get(2)?;
    let input: String = row.get(3)?;
    let output: Option<String> = row.get(4)?;

    Ok(WorkflowExecution {
        id: parse_id(row, 0)?,
        workflow_id: parse_id(row, 1)?,
        status: parse_execution_status(&status),
        input: serde_json::from_str(&input).map_err(|e| json_err(3, e))?,
        output: output
            .map(|raw| serde_json::from_str(&raw).map_err(|e| json_err(4, e)))
            .transpose()?,
        error: row.get(5)?,
        started_at: time::from_sql(&row.get::<_, String>(6)?),
        completed_at: time::opt_from_sql(row.get(7)?),
        triggered_by: row.get(8)?,
        tokens_used: row.get::<_, i64>(9)? as u64,
        cost_credits: row.get(10)?,
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<ExecutionStep> {
    let status: String = row.get(3)?;
    let input: Option<String> = row.get(4)?;
    let output: Option<String> = row.get(5)?;

    Ok(ExecutionStep {
        execution_id: parse_id(row, 0)?,
        index: row.get(1)?,
        name: row.get(2)?,
        status: parse_step_status(&status),
        input: input
            .map(|raw| serde_json::from_str(&raw).map_err(|e| json_err(4, e)))
            .transpose()?,
        output: output
            .map(|raw| serde_json::from_str(&raw).map_err(|e| json_err(5, e)))
            .transpose()?,
        error: row.get(6)?,
        retry_count: row.get(7)?,
        started_at: time::from_sql(&row.get::<_, String>(8)?),
        completed_at: time::opt_from_sql(row.get(9)?),
        tokens_used: row.get::<_, i64>(10)? as u64,
        cost_credits: row.get(11)?,
        duration_ms: row.get::<_, i64>(12)? as u64,
    })
}

fn parse_execution_status(raw: &str) -> ExecutionStatus {
    match raw {
        "pending" => ExecutionStatus::Pending,
        "running" => ExecutionStatus::Running,
        "completed" => ExecutionStatus::Completed,
        "cancelled" => ExecutionStatus::Cancelled,
        _ => ExecutionStatus::Failed,
    }
}

fn parse_step_status(raw: &str) -> StepStatus {
    match raw {
        "pending" => StepStatus::Pending,
        "running" => StepStatus::Running,
        "completed" => StepStatus::Completed,
        "skipped" => StepStatus::Skipped,
        _ => StepStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrations, workflows::WorkflowStore};
    use serde_json::json;
    use toolgrid_types::{ErrorHandling, WorkflowDefinition};

    fn stores() -> (WorkflowStore, ExecutionStore, WorkflowId) {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        let workflows = WorkflowStore::new(db.clone());
        let workflow = workflows
            .insert(
                "daily",
                &WorkflowDefinition {
                    name: "daily".to_string(),
                    description: None,
                    steps: Vec::new(),
                    error_handling: ErrorHandling::default(),
                    timeout_ms: None,
                },
            )
            .unwrap();
        (workflows, ExecutionStore::new(db), workflow.id)
    }

    #[test]
    fn execution_lifecycle() {
        let (_workflows, executions, workflow_id) = stores();

        let execution = executions
            .insert(&workflow_id, &json!({"city": "Paris"}), Some("api"))
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);

        executions
            .set_status(&execution.id, ExecutionStatus::Running)
            .unwrap();
        executions
            .finish(
                &execution.id,
                ExecutionStatus::Completed,
                Some(&json!({"fetch": {"temp": 15}})),
                None,
                120,
                0.5,
            )
            .unwrap();

        let loaded = executions.get(&execution.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.tokens_used, 120);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn step_rows_upsert_in_order() {
        let (_workflows, executions, workflow_id) = stores();
        let execution = executions.insert(&workflow_id, &json!({}), None).unwrap();

        let mut step = ExecutionStep {
            execution_id: execution.id.clone(),
            index: 0,
            name: "fetch".to_string(),
            status: StepStatus::Running,
            input: Some(json!({"city": "Paris"})),
            output: None,
            error: None,
            retry_count: 0,
            started_at: Utc::now(),
            completed_at: None,
            tokens_used: 0,
            cost_credits: 0.0,
            duration_ms: 0,
        };
        executions.upsert_step(&step).unwrap();

        step.status = StepStatus::Completed;
        step.output = Some(json!({"temp": 15}));
        step.completed_at = Some(Utc::now());
        executions.upsert_step(&step).unwrap();

        let steps = executions.steps(&execution.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].output, Some(json!({"temp": 15})));
    }
}
