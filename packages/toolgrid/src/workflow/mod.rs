pub mod host;
pub mod sampling;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use toolgrid_engine::{ExecutionObserver, ExecutionReport, StepReport, WorkflowEngine};
use toolgrid_types::{
    ExecutionId, ExecutionStatus, ExecutionStep, GatewayEvent, RequestContext, Workflow,
    WorkflowExecution, WorkflowId,
};

use crate::budget::{BudgetEnforcer, BudgetError};
use crate::events::EventBus;
use crate::storage::executions::ExecutionStore;
use crate::storage::workflows::WorkflowStore;
use crate::storage::StorageError;
use utils::context::AppContext;
use utils::telemetry::WorkflowMetrics;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("Workflow is disabled: {0}")]
    Disabled(WorkflowId),
    #[error("Budget denied execution: {reason}")]
    BudgetDenied { reason: String },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("budget: {0}")]
    Budget(#[from] BudgetError),
}

/// Drives workflow executions end to end: budget admission, the
/// background engine run, step row persistence, spend recording, and
/// lifecycle events. Executions started from an HTTP request keep
/// running after the response returns.
pub struct WorkflowManager {
    engine: Arc<WorkflowEngine>,
    workflows: WorkflowStore,
    executions: ExecutionStore,
    budget: Arc<BudgetEnforcer>,
    events: Arc<EventBus>,
    env: BTreeMap<String, String>,
    cancels: Arc<DashMap<ExecutionId, CancellationToken>>,
    metrics: WorkflowMetrics,
}

impl WorkflowManager {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        workflows: WorkflowStore,
        executions: ExecutionStore,
        budget: Arc<BudgetEnforcer>,
        events: Arc<EventBus>,
        env: BTreeMap<String, String>,
        metrics: WorkflowMetrics,
    ) -> Self {
        Self {
            engine,
            workflows,
            executions,
            budget,
            events,
            env,
            cancels: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Admits against budgets, creates the execution row, and spawns the
    /// run as a background task on the shared runtime. Returns the
    /// pending execution immediately.
    #[instrument(level = "debug", skip(self, app, ctx, input), fields(subsys = "Workflow", request = %ctx.request_id))]
    pub fn start(
        &self,
        app: &AppContext,
        ctx: &RequestContext,
        workflow_id: &WorkflowId,
        input: serde_json::Value,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let workflow = self
            .workflows
            .get(workflow_id)?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.clone()))?;
        if !workflow.enabled {
            return Err(WorkflowError::Disabled(workflow_id.clone()));
        }

        // budget gate before any execution row exists
        let admission = self.budget.can_execute(
            Some(workflow_id),
            ctx.principal.tenant_id.as_ref(),
            ctx.principal.api_key_id.as_ref(),
        )?;
        if !admission.allowed {
            return Err(WorkflowError::BudgetDenied {
                reason: admission
                    .reason
                    .unwrap_or_else(|| "budget exhausted".to_string()),
            });
        }

        let triggered_by = ctx
            .principal
            .api_key_id
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "master".to_string());
        let execution = self
            .executions
            .insert(workflow_id, &input, Some(&triggered_by))?;

        let cancel = CancellationToken::new();
        self.cancels.insert(execution.id.clone(), cancel.clone());

        self.metrics.increment_total_executions();
        self.events.publish(GatewayEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            execution_id: execution.id.clone(),
        });

        app.rt.spawn({
            let manager = self.clone_parts();
            let workflow = workflow.clone();
            let execution_id = execution.id.clone();
            let ctx = ctx.clone();
            async move {
                manager.run(workflow, execution_id, input, ctx, cancel).await;
            }
        });

        Ok(execution)
    }

    /// Cooperative cancel; returns false when the execution is unknown
    /// or already finished.
    pub fn cancel(&self, execution_id: &ExecutionId) -> bool {
        match self.cancels.get(execution_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<(WorkflowExecution, Vec<ExecutionStep>)>, WorkflowError> {
        let Some(execution) = self.executions.get(execution_id)? else {
            return Ok(None);
        };
        let steps = self.executions.steps(execution_id)?;
        Ok(Some((execution, steps)))
    }

    pub fn list_executions(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self.executions.list(workflow_id, limit, offset)?)
    }

    fn clone_parts(&self) -> RunnerParts {
        RunnerParts {
            engine: self.engine.clone(),
            executions: self.executions.clone(),
            budget: self.budget.clone(),
            events: self.events.clone(),
            env: self.env.clone(),
            cancels: self.cancels.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// The subset of the manager a background run needs.
struct RunnerParts {
    engine: Arc<WorkflowEngine>,
    executions: ExecutionStore,
    budget: Arc<BudgetEnforcer>,
    events: Arc<EventBus>,
    env: BTreeMap<String, String>,
    cancels: Arc<DashMap<ExecutionId, CancellationToken>>,
    metrics: WorkflowMetrics,
}

impl RunnerParts {
    async fn run(
        &self,
        workflow: Workflow,
        execution_id: ExecutionId,
        input: serde_json::Value,
        ctx: RequestContext,
        cancel: CancellationToken,
    ) {
        let started = Utc::now();
        if let Err(err) = self
            .executions
            .set_status(&execution_id, ExecutionStatus::Running)
        {
            tracing::error!(?err, execution = %execution_id, "failed to mark execution running");
        }

        let observer = StepPersister {
            executions: self.executions.clone(),
            execution_id: execution_id.clone(),
        };

        let report = self
            .engine
            .execute(
                &workflow.definition,
                input,
                self.env.clone(),
                cancel,
                &observer,
            )
            .await;

        self.finish(&workflow, &execution_id, &ctx, report, started)
            .await;
        self.cancels.remove(&execution_id);
    }

    async fn finish(
        &self,
        workflow: &Workflow,
        execution_id: &ExecutionId,
        ctx: &RequestContext,
        report: ExecutionReport,
        started: chrono::DateTime<Utc>,
    ) {
        if let Err(err) = self.executions.finish(
            execution_id,
            report.status,
            report.output.as_ref(),
            report.error.as_deref(),
            report.tokens_used,
            report.cost_credits,
        ) {
            tracing::error!(?err, execution = %execution_id, "failed to finish execution row");
        }

        // accounting happens even for failed runs; the credits were spent
        if report.cost_credits > 0.0 {
            if let Err(err) = self.budget.record_spend(
                Some(&workflow.id),
                ctx.principal.tenant_id.as_ref(),
                ctx.principal.api_key_id.as_ref(),
                report.cost_credits,
            ) {
                tracing::error!(?err, "failed to record workflow spend");
            }
        }

        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        let event = match report.status {
            ExecutionStatus::Completed => GatewayEvent::WorkflowCompleted {
                workflow_id: workflow.id.clone(),
                execution_id: execution_id.clone(),
                duration_ms,
            },
            _ => {
                self.metrics.increment_total_errors();
                GatewayEvent::WorkflowFailed {
                    workflow_id: workflow.id.clone(),
                    execution_id: execution_id.clone(),
                    error: report
                        .error
                        .unwrap_or_else(|| report.status.as_str().to_string()),
                }
            }
        };
        self.events.publish(event);
    }
}

/// Writes each step row as the engine reports it; the engine guarantees
/// the call lands before the next step starts.
struct StepPersister {
    executions: ExecutionStore,
    execution_id: ExecutionId,
}

impl ExecutionObserver for StepPersister {
    fn on_step_started(&self, index: u32, name: &str) {
        let step = ExecutionStep {
            execution_id: self.execution_id.clone(),
            index,
            name: name.to_string(),
            status: toolgrid_types::StepStatus::Running,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            started_at: Utc::now(),
            completed_at: None,
            tokens_used: 0,
            cost_credits: 0.0,
            duration_ms: 0,
        };
        if let Err(err) = self.executions.upsert_step(&step) {
            tracing::warn!(?err, "failed to persist step start");
        }
    }

    fn on_step_finished(&self, report: &StepReport) {
        let step = ExecutionStep {
            execution_id: self.execution_id.clone(),
            index: report.index,
            name: report.name.clone(),
            status: report.status,
            input: report.input.clone(),
            output: report.output.clone(),
            error: report.error.clone(),
            retry_count: report.retry_count,
            started_at: report.started_at,
            completed_at: Some(report.completed_at),
            tokens_used: report.cost.tokens_used,
            cost_credits: report.cost.cost_credits,
            duration_ms: report.cost.duration_ms,
        };
        if let Err(err) = self.executions.upsert_step(&step) {
            tracing::warn!(?err, "failed to persist step result");
        }
    }
}
