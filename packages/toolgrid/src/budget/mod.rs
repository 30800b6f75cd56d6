use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use toolgrid_types::{
    ApiKeyId, Budget, BudgetAdmission, BudgetAlert, BudgetId, BudgetPeriod, BudgetScope,
    GatewayEvent, TenantId, WorkflowId,
};

use crate::events::EventBus;
use crate::storage::budgets::{BudgetStore, ThresholdCrossing};
use crate::storage::workflows::WorkflowStore;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Pre-execution admission and post-execution accounting over budgets.
/// Threshold alerts fire at most once per period; crossing 100% on an
/// enforced workflow-scope budget pauses the workflow.
pub struct BudgetEnforcer {
    store: BudgetStore,
    workflows: WorkflowStore,
    events: Arc<EventBus>,
}

impl BudgetEnforcer {
    pub fn new(store: BudgetStore, workflows: WorkflowStore, events: Arc<EventBus>) -> Self {
        Self {
            store,
            workflows,
            events,
        }
    }

    /// Most specific scope first: workflow, tenant, api key, global. The
    /// first budget that is enabled, enforcing, and out of credits denies.
    #[instrument(level = "debug", skip(self), fields(subsys = "Budget"))]
    pub fn can_execute(
        &self,
        workflow_id: Option<&WorkflowId>,
        tenant_id: Option<&TenantId>,
        api_key_id: Option<&ApiKeyId>,
    ) -> Result<BudgetAdmission, BudgetError> {
        let candidates = scope_chain(workflow_id, tenant_id, api_key_id);

        let mut most_specific: Option<Budget> = None;
        for (scope, scope_id) in candidates {
            let Some(budget) = self.store.find_enabled(scope, scope_id.as_deref())? else {
                continue;
            };

            if budget.enforce_limit && budget.current_spend >= budget.budget_credits {
                let percentage = budget.percentage_used();
                return Ok(BudgetAdmission {
                    allowed: false,
                    reason: Some(format!(
                        "budget '{}' ({}) exhausted: {:.1} of {:.1} credits used",
                        budget.name,
                        budget.scope.as_str(),
                        budget.current_spend,
                        budget.budget_credits,
                    )),
                    budget_id: Some(budget.id.clone()),
                    current_spend: budget.current_spend,
                    budget_limit: budget.budget_credits,
                    percentage_used: percentage,
                });
            }

            if most_specific.is_none() {
                most_specific = Some(budget);
            }
        }

        Ok(match most_specific {
            Some(budget) => BudgetAdmission {
                allowed: true,
                reason: None,
                budget_id: Some(budget.id.clone()),
                current_spend: budget.current_spend,
                budget_limit: budget.budget_credits,
                percentage_used: budget.percentage_used(),
            },
            None => BudgetAdmission::unlimited(),
        })
    }

    /// Charges every applicable budget in one transaction, then publishes
    /// whatever thresholds were crossed. Workflow pausing happens here so
    /// the caller cannot forget it.
    #[instrument(level = "debug", skip(self), fields(subsys = "Budget"))]
    pub fn record_spend(
        &self,
        workflow_id: Option<&WorkflowId>,
        tenant_id: Option<&TenantId>,
        api_key_id: Option<&ApiKeyId>,
        credits: f64,
    ) -> Result<(), BudgetError> {
        let applicable = scope_chain(workflow_id, tenant_id, api_key_id);
        let crossings = self.store.record_spend(&applicable, credits)?;

        for crossing in crossings {
            self.publish_crossing(&crossing);

            let exceeded = crossing.threshold >= 100;
            if exceeded
                && crossing.budget.scope == BudgetScope::Workflow
                && crossing.budget.enforce_limit
            {
                self.pause_workflow(&crossing.budget);
            }
        }

        Ok(())
    }

    fn publish_crossing(&self, crossing: &ThresholdCrossing) {
        let budget_id = crossing.budget.id.clone();
        let percentage_used = crossing.percentage_used;
        let event = match crossing.threshold {
            50 => GatewayEvent::BudgetThreshold50Reached {
                budget_id,
                percentage_used,
            },
            75 => GatewayEvent::BudgetThreshold75Reached {
                budget_id,
                percentage_used,
            },
            90 => GatewayEvent::BudgetThreshold90Reached {
                budget_id,
                percentage_used,
            },
            _ => GatewayEvent::BudgetExceeded {
                budget_id,
                percentage_used,
            },
        };
        self.events.publish(event);
    }

    fn pause_workflow(&self, budget: &Budget) {
        let Some(scope_id) = budget.scope_id.as_deref() else {
            return;
        };
        let Ok(workflow_id) = WorkflowId::new(scope_id) else {
            tracing::warn!(scope_id, "workflow budget has malformed scope id");
            return;
        };

        match self.workflows.set_enabled(&workflow_id, false) {
            Ok(true) => {
                tracing::warn!(workflow = %workflow_id, budget = %budget.id, "workflow paused: budget exhausted");
                if let Err(err) = self.store.insert_violation(budget, Some(scope_id)) {
                    tracing::warn!(?err, "failed to record budget violation");
                }
                self.events.publish(GatewayEvent::WorkflowPausedBudget {
                    workflow_id,
                    budget_id: budget.id.clone(),
                });
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(?err, "failed to pause workflow"),
        }
    }

    // CRUD passthroughs

    #[allow(clippy::too_many_arguments)]
    pub fn create_budget(
        &self,
        name: &str,
        scope: BudgetScope,
        scope_id: Option<&str>,
        budget_credits: f64,
        period: BudgetPeriod,
        enabled: bool,
        enforce_limit: bool,
    ) -> Result<Budget, StorageError> {
        self.store
            .create(name, scope, scope_id, budget_credits, period, enabled, enforce_limit)
    }

    pub fn update_budget(
        &self,
        id: &BudgetId,
        name: Option<&str>,
        budget_credits: Option<f64>,
        enabled: Option<bool>,
        enforce_limit: Option<bool>,
    ) -> Result<Budget, StorageError> {
        self.store.update(id, name, budget_credits, enabled, enforce_limit)
    }

    pub fn delete_budget(&self, id: &BudgetId) -> Result<bool, StorageError> {
        self.store.delete(id)
    }

    pub fn get_status(&self, id: &BudgetId) -> Result<Option<(Budget, Vec<BudgetAlert>)>, StorageError> {
        let Some(budget) = self.store.get(id)? else {
            return Ok(None);
        };
        let alerts = self.store.alerts(id)?;
        Ok(Some((budget, alerts)))
    }

    pub fn list_budgets(&self) -> Result<Vec<Budget>, StorageError> {
        self.store.list()
    }
}

fn scope_chain(
    workflow_id: Option<&WorkflowId>,
    tenant_id: Option<&TenantId>,
    api_key_id: Option<&ApiKeyId>,
) -> Vec<(BudgetScope, Option<String>)> {
    let mut chain = Vec::with_capacity(4);
    if let Some(workflow_id) = workflow_id {
        chain.push((BudgetScope::Workflow, Some(workflow_id.to_string())));
    }
    if let Some(tenant_id) = tenant_id {
        chain.push((BudgetScope::Tenant, Some(tenant_id.to_string())));
    }
    if let Some(api_key_id) = api_key_id {
        chain.push((BudgetScope::ApiKey, Some(api_key_id.to_string())));
    }
    chain.push((BudgetScope::Global, None));
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrations, Db};
    use std::sync::Mutex;
    use toolgrid_types::{ErrorHandling, WorkflowDefinition};

    fn setup() -> (BudgetEnforcer, WorkflowStore, Arc<Mutex<Vec<String>>>) {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();

        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.kind().to_string());
        });

        let workflows = WorkflowStore::new(db.clone());
        let enforcer = BudgetEnforcer::new(BudgetStore::new(db), workflows.clone(), bus);
        (enforcer, workflows, seen)
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".to_string(),
            description: None,
            steps: Vec::new(),
            error_handling: ErrorHandling::default(),
            timeout_ms: None,
        }
    }

    #[test]
    fn global_budget_stops_at_limit_and_fires_thresholds_once() {
        let (enforcer, _workflows, seen) = setup();
        enforcer
            .create_budget("global", BudgetScope::Global, None, 100.0, BudgetPeriod::Total, true, true)
            .unwrap();

        // two executions of 40 credits each
        for _ in 0..2 {
            let admission = enforcer.can_execute(None, None, None).unwrap();
            assert!(admission.allowed);
            enforcer.record_spend(None, None, None, 40.0).unwrap();
        }

        {
            let events = seen.lock().unwrap();
            assert_eq!(
                events
                    .iter()
                    .filter(|k| k.starts_with("budget.threshold_50"))
                    .count(),
                1
            );
            assert_eq!(
                events
                    .iter()
                    .filter(|k| k.starts_with("budget.threshold_75"))
                    .count(),
                1
            );
        }

        // 80 of 100 used; limit not reached yet
        let admission = enforcer.can_execute(None, None, None).unwrap();
        assert!(admission.allowed);

        enforcer.record_spend(None, None, None, 40.0).unwrap();

        let admission = enforcer.can_execute(None, None, None).unwrap();
        assert!(!admission.allowed);
        assert!(admission.reason.as_ref().unwrap().contains("global"));
        assert!(seen.lock().unwrap().contains(&"budget.exceeded".to_string()));
    }

    #[test]
    fn workflow_budget_pauses_workflow_on_exhaustion() {
        let (enforcer, workflows, seen) = setup();
        let workflow = workflows.insert("wf", &definition()).unwrap();

        enforcer
            .create_budget(
                "per-wf",
                BudgetScope::Workflow,
                Some(workflow.id.as_ref()),
                10.0,
                BudgetPeriod::Total,
                true,
                true,
            )
            .unwrap();

        enforcer
            .record_spend(Some(&workflow.id), None, None, 12.0)
            .unwrap();

        assert!(!workflows.get(&workflow.id).unwrap().unwrap().enabled);
        assert!(seen
            .lock()
            .unwrap()
            .contains(&"workflow.paused_budget".to_string()));
    }

    #[test]
    fn precedence_prefers_workflow_scope() {
        let (enforcer, workflows, _seen) = setup();
        let workflow = workflows.insert("wf", &definition()).unwrap();

        enforcer
            .create_budget("global", BudgetScope::Global, None, 1000.0, BudgetPeriod::Total, true, true)
            .unwrap();
        let wf_budget = enforcer
            .create_budget(
                "per-wf",
                BudgetScope::Workflow,
                Some(workflow.id.as_ref()),
                5.0,
                BudgetPeriod::Total,
                true,
                true,
            )
            .unwrap();

        enforcer
            .record_spend(Some(&workflow.id), None, None, 5.0)
            .unwrap();

        let admission = enforcer
            .can_execute(Some(&workflow.id), None, None)
            .unwrap();
        assert!(!admission.allowed);
        assert_eq!(admission.budget_id, Some(wf_budget.id));
    }

    #[test]
    fn no_budgets_means_unlimited() {
        let (enforcer, _workflows, _seen) = setup();
        let admission = enforcer.can_execute(None, None, None).unwrap();
        assert!(admission.allowed);
        assert!(admission.budget_id.is_none());
    }
}
