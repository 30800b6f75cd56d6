use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use toolgrid_types::{
    Condition, ErrorStrategy, ExecutionStatus, Step, StepCost, StepErrorAction, StepStatus,
    StepType, WorkflowDefinition,
};

use crate::condition;
use crate::context::ExecutionContext;
use crate::cost;
use crate::error::{EngineError, HostError};
use crate::host::{SamplingRequest, StepHost};
use crate::template::{self, TemplateCache};

pub struct EngineConfig {
    pub template_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_cache_size: template::DEFAULT_CACHE_SIZE,
        }
    }
}

/// Sequences workflow steps against a [`StepHost`]. One engine serves all
/// executions; the template cache is shared across them.
pub struct WorkflowEngine {
    templates: Arc<TemplateCache>,
    host: Arc<dyn StepHost>,
}

/// Callback seam for persisting step rows. `on_step_finished` is invoked
/// before the following step starts, so a dependent step only ever runs
/// after its predecessor's record is durable.
pub trait ExecutionObserver: Send + Sync {
    fn on_step_started(&self, index: u32, name: &str);
    fn on_step_finished(&self, report: &StepReport);
}

pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_step_started(&self, _index: u32, _name: &str) {}
    fn on_step_finished(&self, _report: &StepReport) {}
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub index: u32,
    pub name: String,
    pub status: StepStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub cost: StepCost,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub steps: Vec<StepReport>,
    pub tokens_used: u64,
    pub cost_credits: f64,
}

struct RunState {
    ctx: ExecutionContext,
    reports: Vec<StepReport>,
    tokens_used: u64,
    cost_credits: f64,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, host: Arc<dyn StepHost>) -> Self {
        Self {
            templates: Arc::new(TemplateCache::new(config.template_cache_size)),
            host,
        }
    }

    pub fn template_cache(&self) -> &TemplateCache {
        &self.templates
    }

    /// Runs a definition to a terminal report. Cancellation is
    /// cooperative: the token is checked between steps and while parallel
    /// branches are being gathered. A definition timeout cancels in-flight
    /// work and fails the execution with reason "timeout".
    #[instrument(level = "debug", skip_all, fields(subsys = "Engine", workflow = %definition.name))]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
        env: BTreeMap<String, String>,
        cancel: CancellationToken,
        observer: &dyn ExecutionObserver,
    ) -> ExecutionReport {
        if let Err(err) = validate_definition(definition) {
            return ExecutionReport {
                status: ExecutionStatus::Failed,
                output: None,
                error: Some(err.to_string()),
                steps: Vec::new(),
                tokens_used: 0,
                cost_credits: 0.0,
            };
        }

        let state = Arc::new(Mutex::new(RunState {
            ctx: ExecutionContext::new(input, env),
            reports: Vec::new(),
            tokens_used: 0,
            cost_credits: 0.0,
        }));

        let run = self.run_steps(definition, state.clone(), cancel.clone(), observer);

        let outcome = match definition.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    Err("timeout".to_string())
                }
            },
            None => run.await,
        };

        let state = Arc::try_unwrap(state)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| {
                // the run future still holds a clone (timeout path); a
                // snapshot of what completed is all we can report
                let guard = arc.lock().unwrap();
                RunState {
                    ctx: guard.ctx.clone(),
                    reports: guard.reports.clone(),
                    tokens_used: guard.tokens_used,
                    cost_credits: guard.cost_credits,
                }
            });

        let (status, error) = match outcome {
            Ok(()) => (ExecutionStatus::Completed, None),
            Err(reason) if reason == "cancelled" => (ExecutionStatus::Cancelled, Some(reason)),
            Err(reason) => (ExecutionStatus::Failed, Some(reason)),
        };

        ExecutionReport {
            status,
            output: Some(state.ctx.outputs()),
            error,
            steps: state.reports,
            tokens_used: state.tokens_used,
            cost_credits: state.cost_credits,
        }
    }

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        state: Arc<Mutex<RunState>>,
        cancel: CancellationToken,
        observer: &dyn ExecutionObserver,
    ) -> Result<(), String> {
        for (index, step) in definition.steps.iter().enumerate() {
            let index = index as u32;

            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }

            let root = state.lock().unwrap().ctx.as_root();

            if let Some(guard) = &step.condition {
                if !condition::evaluate(guard, &root) {
                    let now = Utc::now();
                    let report = StepReport {
                        index,
                        name: step.name.clone(),
                        status: StepStatus::Skipped,
                        input: None,
                        output: None,
                        error: None,
                        retry_count: 0,
                        started_at: now,
                        completed_at: now,
                        cost: StepCost::default(),
                    };
                    observer.on_step_finished(&report);
                    state.lock().unwrap().reports.push(report);
                    continue;
                }
            }

            observer.on_step_started(index, &step.name);
            let started_at = Utc::now();

            let result = self
                .run_step_with_retry(step, state.clone(), cancel.clone())
                .await;

            let completed_at = Utc::now();
            let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;

            match result {
                Ok(outcome) => {
                    let tokens = outcome.tokens;
                    let credits = cost::credits_for(tokens, outcome.model.as_deref());
                    let report = StepReport {
                        index,
                        name: step.name.clone(),
                        status: StepStatus::Completed,
                        input: outcome.input,
                        output: Some(outcome.output.clone()),
                        error: None,
                        retry_count: outcome.retries,
                        started_at,
                        completed_at,
                        cost: StepCost {
                            tokens_used: tokens,
                            cost_credits: credits,
                            duration_ms,
                        },
                    };

                    {
                        let mut guard = state.lock().unwrap();
                        guard.ctx.record_output(&step.name, outcome.output);
                        for (name, value) in outcome.child_outputs {
                            guard.ctx.record_output(&name, value);
                        }
                        guard.tokens_used += tokens;
                        guard.cost_credits += credits;
                        guard.reports.push(report.clone());
                    }
                    // the step row must be durable before the next step starts
                    observer.on_step_finished(&report);
                }
                Err(failure) => {
                    let report = StepReport {
                        index,
                        name: step.name.clone(),
                        status: StepStatus::Failed,
                        input: failure.input,
                        output: None,
                        error: Some(failure.error.clone()),
                        retry_count: failure.retries,
                        started_at,
                        completed_at,
                        cost: StepCost {
                            tokens_used: 0,
                            cost_credits: 0.0,
                            duration_ms,
                        },
                    };

                    {
                        let mut guard = state.lock().unwrap();
                        guard.ctx.record_error(&step.name, &failure.error);
                        guard.reports.push(report.clone());
                    }
                    observer.on_step_finished(&report);

                    if failure.cancelled {
                        return Err("cancelled".to_string());
                    }

                    let proceed = match step.on_error {
                        Some(StepErrorAction::Continue) => true,
                        Some(StepErrorAction::Stop) => false,
                        // retry already happened; None and exhausted
                        // retries fall back to the workflow strategy
                        _ => definition.error_handling.strategy == ErrorStrategy::Continue,
                    };

                    if !proceed {
                        return Err(format!("step '{}' failed: {}", step.name, failure.error));
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_step_with_retry(
        &self,
        step: &Step,
        state: Arc<Mutex<RunState>>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, StepFailure> {
        let max_attempts = step
            .retry_config
            .map(|r| r.max_attempts.max(1))
            .unwrap_or(1);

        let mut last_failure = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let retry = step.retry_config.expect("attempts > 1 implies retry config");
                let delay = retry.backoff_ms as f64 * retry.multiplier.powi(attempt as i32 - 1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {}
                    _ = cancel.cancelled() => {
                        return Err(StepFailure::cancelled(attempt));
                    }
                }
            }

            match self.dispatch(step, state.clone(), cancel.clone()).await {
                Ok(mut outcome) => {
                    outcome.retries = attempt;
                    return Ok(outcome);
                }
                Err(mut failure) => {
                    failure.retries = attempt;
                    let retryable = failure.retryable && !failure.cancelled;
                    let exhausted = attempt + 1 >= max_attempts;
                    if !retryable || exhausted {
                        return Err(failure);
                    }
                    tracing::debug!(
                        step = %step.name,
                        attempt,
                        error = %failure.error,
                        "step failed, retrying"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        // loop always returns before falling through when max_attempts >= 1
        Err(last_failure.unwrap_or_else(|| StepFailure::internal("no attempts were made")))
    }

    async fn dispatch(
        &self,
        step: &Step,
        state: Arc<Mutex<RunState>>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, StepFailure> {
        match step.step_type {
            StepType::Tool | StepType::Prompt | StepType::Resource | StepType::Sampling => {
                let root = state.lock().unwrap().ctx.as_root();
                let config = template::interpolate(&self.templates, &step.config, &root)
                    .map_err(|e| StepFailure::config(&step.name, e.to_string()))?;
                let model = config
                    .get("modelName")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let (output, model_from_call) = match self
                    .dispatch_leaf(step.step_type, &step.name, config.clone())
                    .await
                {
                    Ok(result) => result,
                    Err(mut failure) => {
                        failure.input = Some(config);
                        return Err(failure);
                    }
                };

                let tokens = cost::tokens_for_output(&output);
                Ok(StepOutcome {
                    input: Some(config),
                    output,
                    tokens,
                    model: model.or(model_from_call),
                    retries: 0,
                    child_outputs: Vec::new(),
                })
            }
            StepType::Parallel => self.dispatch_parallel(step, state, cancel).await,
            StepType::Condition => self.dispatch_condition(step, state, cancel).await,
        }
    }

    async fn dispatch_leaf(
        &self,
        step_type: StepType,
        step_name: &str,
        config: Value,
    ) -> Result<(Value, Option<String>), StepFailure> {
        match step_type {
            StepType::Tool => {
                let qualified = require_str(&config, "tool", step_name)?;
                let params = config.get("params").cloned().unwrap_or(json!({}));
                let output = self
                    .host
                    .call_tool(&qualified, params)
                    .await
                    .map_err(|e| StepFailure::host(e))?;
                Ok((output, None))
            }
            StepType::Prompt => {
                let qualified = require_str(&config, "prompt", step_name)?;
                let arguments = config.get("arguments").cloned().unwrap_or(json!({}));
                let output = self
                    .host
                    .get_prompt(&qualified, arguments)
                    .await
                    .map_err(|e| StepFailure::host(e))?;
                Ok((output, None))
            }
            StepType::Resource => {
                let uri = require_str(&config, "uri", step_name)?;
                let output = self
                    .host
                    .read_resource(&uri)
                    .await
                    .map_err(|e| StepFailure::host(e))?;
                Ok((output, None))
            }
            StepType::Sampling => {
                let request: SamplingRequest = serde_json::from_value(config)
                    .map_err(|e| StepFailure::config(step_name, e.to_string()))?;
                let response = self
                    .host
                    .sample(request)
                    .await
                    .map_err(|e| StepFailure::host(e))?;
                let model = response.model.clone();
                let output = serde_json::to_value(&response).unwrap_or(Value::Null);
                Ok((output, model))
            }
            _ => Err(StepFailure::config(step_name, "not a leaf step")),
        }
    }

    /// Runs `config.steps` concurrently against a snapshot of the
    /// context; siblings do not see each other's outputs. Any child
    /// failure fails the parent.
    async fn dispatch_parallel(
        &self,
        step: &Step,
        state: Arc<Mutex<RunState>>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, StepFailure> {
        let children = parse_sub_steps(&step.config, "steps", &step.name)?;
        let root = state.lock().unwrap().ctx.as_root();

        let futures = children.iter().map(|child| {
            let root = root.clone();
            async move {
                let config = template::interpolate(&self.templates, &child.config, &root)
                    .map_err(|e| StepFailure::config(&child.name, e.to_string()))?;
                let (output, _) = self
                    .dispatch_leaf(child.step_type, &child.name, config)
                    .await?;
                Ok::<(String, Value), StepFailure>((child.name.clone(), output))
            }
        });

        let gathered = tokio::select! {
            results = join_all(futures) => results,
            _ = cancel.cancelled() => {
                return Err(StepFailure::cancelled(0));
            }
        };

        let mut outputs = Map::new();
        let mut child_outputs = Vec::new();
        for result in gathered {
            let (name, output) = result?;
            child_outputs.push((name.clone(), output.clone()));
            outputs.insert(name, output);
        }

        let output = Value::Object(outputs);
        let tokens = cost::estimate_tokens(&output);
        Ok(StepOutcome {
            input: None,
            output,
            tokens,
            model: None,
            retries: 0,
            child_outputs,
        })
    }

    /// Evaluates `config.condition` and runs the `then` or `else` branch
    /// sequentially; each branch step's output lands in the context as it
    /// completes, so later branch steps can reference earlier ones.
    async fn dispatch_condition(
        &self,
        step: &Step,
        state: Arc<Mutex<RunState>>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, StepFailure> {
        let guard: Condition = step
            .config
            .get("condition")
            .cloned()
            .ok_or_else(|| StepFailure::config(&step.name, "missing 'condition'"))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| StepFailure::config(&step.name, e.to_string()))
            })?;

        let root = state.lock().unwrap().ctx.as_root();
        let branch = if condition::evaluate(&guard, &root) {
            "then"
        } else {
            "else"
        };

        let children = match step.config.get(branch) {
            Some(_) => parse_sub_steps(&step.config, branch, &step.name)?,
            None => Vec::new(),
        };

        let mut outputs = Map::new();
        let mut child_outputs: Vec<(String, Value)> = Vec::new();
        for child in &children {
            if cancel.is_cancelled() {
                return Err(StepFailure::cancelled(0));
            }
            let root = {
                let mut snapshot = state.lock().unwrap().ctx.clone();
                for (name, value) in &child_outputs {
                    snapshot.record_output(name, value.clone());
                }
                snapshot.as_root()
            };
            let config = template::interpolate(&self.templates, &child.config, &root)
                .map_err(|e| StepFailure::config(&child.name, e.to_string()))?;
            let (output, _) = self
                .dispatch_leaf(child.step_type, &child.name, config)
                .await?;
            child_outputs.push((child.name.clone(), output.clone()));
            outputs.insert(child.name.clone(), output);
        }

        let output = json!({"branch": branch, "outputs": Value::Object(outputs)});
        let tokens = cost::estimate_tokens(&output);
        Ok(StepOutcome {
            input: None,
            output,
            tokens,
            model: None,
            retries: 0,
            child_outputs,
        })
    }
}

struct StepOutcome {
    input: Option<Value>,
    output: Value,
    tokens: u64,
    model: Option<String>,
    retries: u32,
    /// Sub-step outputs (parallel / condition branches) merged into the
    /// context so later steps can reference them by name.
    child_outputs: Vec<(String, Value)>,
}

struct StepFailure {
    error: String,
    retryable: bool,
    cancelled: bool,
    retries: u32,
    input: Option<Value>,
}

impl StepFailure {
    fn host(err: HostError) -> Self {
        Self {
            retryable: err.is_retryable(),
            error: err.to_string(),
            cancelled: false,
            retries: 0,
            input: None,
        }
    }

    fn config(step: &str, reason: impl Into<String>) -> Self {
        Self {
            error: format!("invalid config for step '{}': {}", step, reason.into()),
            retryable: false,
            cancelled: false,
            retries: 0,
            input: None,
        }
    }

    fn internal(reason: &str) -> Self {
        Self {
            error: reason.to_string(),
            retryable: false,
            cancelled: false,
            retries: 0,
            input: None,
        }
    }

    fn cancelled(retries: u32) -> Self {
        Self {
            error: "cancelled".to_string(),
            retryable: false,
            cancelled: true,
            retries,
            input: None,
        }
    }
}

fn require_str(config: &Value, key: &str, step: &str) -> Result<String, StepFailure> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StepFailure::config(step, format!("missing '{key}'")))
}

fn parse_sub_steps(config: &Value, key: &str, step: &str) -> Result<Vec<Step>, StepFailure> {
    let raw = config
        .get(key)
        .ok_or_else(|| StepFailure::config(step, format!("missing '{key}'")))?;
    serde_json::from_value(raw.clone()).map_err(|e| StepFailure::config(step, e.to_string()))
}

fn validate_definition(definition: &WorkflowDefinition) -> Result<(), EngineError> {
    let mut seen = BTreeSet::new();
    for step in &definition.steps {
        if step.name.trim().is_empty() {
            return Err(EngineError::BadStepConfig {
                step: format!("#{}", seen.len()),
                reason: "step name must not be empty".to_string(),
            });
        }
        if !seen.insert(step.name.as_str()) {
            return Err(EngineError::DuplicateStepName(step.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use toolgrid_types::{ConditionOperator, ErrorHandling, RetryConfig};

    /// Scripted host: tool calls echo their params, `fail/*` tools fail
    /// with an upstream error a configurable number of times.
    struct ScriptedHost {
        fail_times: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedHost {
        fn new(fail_times: u32) -> Self {
            Self {
                fail_times: AtomicU32::new(fail_times),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StepHost for ScriptedHost {
        async fn call_tool(&self, qualified_name: &str, params: Value) -> Result<Value, HostError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if qualified_name.starts_with("fail/") {
                let remaining = self.fail_times.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_times.fetch_sub(1, Ordering::SeqCst);
                    return Err(HostError::upstream("synthetic failure"));
                }
            }
            if qualified_name == "weather/current" {
                return Ok(json!({"temp": 15}));
            }
            Ok(json!({"tool": qualified_name, "params": params}))
        }

        async fn get_prompt(&self, qualified_name: &str, arguments: Value) -> Result<Value, HostError> {
            Ok(json!({"prompt": qualified_name, "arguments": arguments}))
        }

        async fn read_resource(&self, uri: &str) -> Result<Value, HostError> {
            Ok(json!({"uri": uri, "contents": "data"}))
        }

        async fn sample(&self, request: SamplingRequest) -> Result<crate::host::SamplingResponse, HostError> {
            Ok(crate::host::SamplingResponse {
                content: format!("echo: {}", request.prompt),
                model: request.model_name,
                tokens_used: Some(12),
            })
        }
    }

    fn engine(host: ScriptedHost) -> WorkflowEngine {
        WorkflowEngine::new(EngineConfig::default(), Arc::new(host))
    }

    fn tool_step(name: &str, config: Value) -> Step {
        Step {
            name: name.to_string(),
            step_type: StepType::Tool,
            config,
            on_error: None,
            retry_config: None,
            condition: None,
        }
    }

    fn definition(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test".to_string(),
            description: None,
            steps,
            error_handling: ErrorHandling::default(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn templated_params_and_json_auto_parse_flow_between_steps() {
        let engine = engine(ScriptedHost::new(0));
        let def = definition(vec![
            tool_step(
                "fetch",
                json!({"tool": "weather/current", "params": {"city": "{{ input.city }}"}}),
            ),
            Step {
                name: "report".to_string(),
                step_type: StepType::Prompt,
                config: json!({"prompt": "summary/daily", "arguments": {"data": "{{ steps.fetch.output }}"}}),
                on_error: None,
                retry_config: None,
                condition: None,
            },
        ]);

        let report = engine
            .execute(
                &def,
                json!({"city": "Paris"}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        let output = report.output.unwrap();
        // the rendered template JSON-parses back into an object
        assert_eq!(output["report"]["arguments"]["data"], json!({"temp": 15}));
    }

    #[tokio::test]
    async fn retry_runs_up_to_max_attempts() {
        let host = ScriptedHost::new(2);
        let engine = engine(host);
        let def = definition(vec![Step {
            name: "flaky".to_string(),
            step_type: StepType::Tool,
            config: json!({"tool": "fail/now", "params": {}}),
            on_error: Some(StepErrorAction::Retry),
            retry_config: Some(RetryConfig {
                max_attempts: 3,
                backoff_ms: 1,
                multiplier: 1.0,
            }),
            condition: None,
        }]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.steps[0].retry_count, 2);
    }

    #[tokio::test]
    async fn single_attempt_when_max_attempts_is_one() {
        let host = ScriptedHost::new(5);
        let engine = engine(host);
        let def = definition(vec![Step {
            name: "flaky".to_string(),
            step_type: StepType::Tool,
            config: json!({"tool": "fail/now", "params": {}}),
            on_error: Some(StepErrorAction::Retry),
            retry_config: Some(RetryConfig {
                max_attempts: 1,
                backoff_ms: 1,
                multiplier: 1.0,
            }),
            condition: None,
        }]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.steps[0].retry_count, 0);
    }

    #[tokio::test]
    async fn on_error_continue_keeps_going() {
        let host = ScriptedHost::new(10);
        let engine = engine(host);
        let def = definition(vec![
            Step {
                name: "flaky".to_string(),
                step_type: StepType::Tool,
                config: json!({"tool": "fail/now", "params": {}}),
                on_error: Some(StepErrorAction::Continue),
                retry_config: None,
                condition: None,
            },
            tool_step("after", json!({"tool": "echo/ok", "params": {}})),
        ]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(report.steps[1].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_gathers_outputs_by_name() {
        let engine = engine(ScriptedHost::new(0));
        let def = definition(vec![Step {
            name: "fanout".to_string(),
            step_type: StepType::Parallel,
            config: json!({"steps": [
                {"name": "a", "type": "tool", "config": {"tool": "echo/a", "params": {}}},
                {"name": "b", "type": "tool", "config": {"tool": "echo/b", "params": {}}}
            ]}),
            on_error: None,
            retry_config: None,
            condition: None,
        }]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        let output = report.steps[0].output.as_ref().unwrap();
        assert_eq!(output["a"]["tool"], "echo/a");
        assert_eq!(output["b"]["tool"], "echo/b");
    }

    #[tokio::test]
    async fn parallel_fails_when_any_child_fails() {
        let host = ScriptedHost::new(10);
        let engine = engine(host);
        let def = definition(vec![Step {
            name: "fanout".to_string(),
            step_type: StepType::Parallel,
            config: json!({"steps": [
                {"name": "ok", "type": "tool", "config": {"tool": "echo/a", "params": {}}},
                {"name": "bad", "type": "tool", "config": {"tool": "fail/now", "params": {}}}
            ]}),
            on_error: None,
            retry_config: None,
            condition: None,
        }]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn condition_step_picks_branch_and_exposes_outputs() {
        let engine = engine(ScriptedHost::new(0));
        let def = definition(vec![
            tool_step(
                "fetch",
                json!({"tool": "weather/current", "params": {}}),
            ),
            Step {
                name: "decide".to_string(),
                step_type: StepType::Condition,
                config: json!({
                    "condition": {"operator": "gt", "path": "steps.fetch.output.temp", "value": 10},
                    "then": [{"name": "warm", "type": "tool", "config": {"tool": "echo/warm", "params": {}}}],
                    "else": [{"name": "cold", "type": "tool", "config": {"tool": "echo/cold", "params": {}}}]
                }),
                on_error: None,
                retry_config: None,
                condition: None,
            },
            tool_step(
                "after",
                json!({"tool": "echo/after", "params": {"prev": "{{ steps.warm.output.tool }}"}}),
            ),
        ]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.steps[1].output.as_ref().unwrap()["branch"], "then");
        // branch outputs are visible to later steps
        let output = report.output.unwrap();
        assert_eq!(output["after"]["params"]["prev"], "echo/warm");
    }

    #[tokio::test]
    async fn step_condition_guard_skips() {
        let engine = engine(ScriptedHost::new(0));
        let def = definition(vec![Step {
            name: "guarded".to_string(),
            step_type: StepType::Tool,
            config: json!({"tool": "echo/never", "params": {}}),
            on_error: None,
            retry_config: None,
            condition: Some(Condition {
                operator: ConditionOperator::Exists,
                path: "input.missing".to_string(),
                value: None,
            }),
        }]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn timeout_fails_the_execution() {
        struct SlowHost;

        #[async_trait]
        impl StepHost for SlowHost {
            async fn call_tool(&self, _: &str, _: Value) -> Result<Value, HostError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            }
            async fn get_prompt(&self, _: &str, _: Value) -> Result<Value, HostError> {
                unreachable!()
            }
            async fn read_resource(&self, _: &str) -> Result<Value, HostError> {
                unreachable!()
            }
            async fn sample(
                &self,
                _: SamplingRequest,
            ) -> Result<crate::host::SamplingResponse, HostError> {
                unreachable!()
            }
        }

        let engine = WorkflowEngine::new(EngineConfig::default(), Arc::new(SlowHost));
        let mut def = definition(vec![tool_step("slow", json!({"tool": "slow/slow", "params": {}}))]);
        def.timeout_ms = Some(50);

        let cancel = CancellationToken::new();
        let report = engine
            .execute(&def, json!({}), BTreeMap::new(), cancel.clone(), &NoopObserver)
            .await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("timeout"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn sampling_step_records_model_tokens() {
        let engine = engine(ScriptedHost::new(0));
        let def = definition(vec![Step {
            name: "summarize".to_string(),
            step_type: StepType::Sampling,
            config: json!({"prompt": "hello {{ input.name }}", "modelName": "gpt-4o"}),
            on_error: None,
            retry_config: None,
            condition: None,
        }]);

        let report = engine
            .execute(
                &def,
                json!({"name": "world"}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.steps[0].cost.tokens_used, 12);
        assert!(report.steps[0].cost.cost_credits > 0.0);
        let output = report.steps[0].output.as_ref().unwrap();
        assert_eq!(output["content"], "echo: hello world");
    }

    #[tokio::test]
    async fn duplicate_step_names_rejected() {
        let engine = engine(ScriptedHost::new(0));
        let def = definition(vec![
            tool_step("same", json!({"tool": "echo/1", "params": {}})),
            tool_step("same", json!({"tool": "echo/2", "params": {}})),
        ]);

        let report = engine
            .execute(
                &def,
                json!({}),
                BTreeMap::new(),
                CancellationToken::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.error.unwrap().contains("Duplicate step name"));
    }
}
