use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::BudgetId;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Workflow,
    Tenant,
    ApiKey,
    Global,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::Workflow => "workflow",
            BudgetScope::Tenant => "tenant",
            BudgetScope::ApiKey => "api_key",
            BudgetScope::Global => "global",
        }
    }
}

impl std::str::FromStr for BudgetScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(BudgetScope::Workflow),
            "tenant" => Ok(BudgetScope::Tenant),
            "api_key" => Ok(BudgetScope::ApiKey),
            "global" => Ok(BudgetScope::Global),
            other => Err(format!("unknown budget scope: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    Total,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::Total => "total",
        }
    }
}

impl std::str::FromStr for BudgetPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(BudgetPeriod::Daily),
            "weekly" => Ok(BudgetPeriod::Weekly),
            "monthly" => Ok(BudgetPeriod::Monthly),
            "total" => Ok(BudgetPeriod::Total),
            other => Err(format!("unknown budget period: {other}")),
        }
    }
}

/// A spend ceiling over one scope and period. At most one enabled budget
/// may exist per (scope, scope_id, period).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub id: BudgetId,
    pub name: String,
    pub scope: BudgetScope,
    /// None for global scope; the workflow/tenant/api-key id otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub budget_credits: f64,
    pub period: BudgetPeriod,
    pub period_start: DateTime<Utc>,
    /// None for `total` budgets, which never auto-reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
    pub current_spend: f64,
    pub enabled: bool,
    pub enforce_limit: bool,
}

impl Budget {
    pub fn percentage_used(&self) -> f64 {
        if self.budget_credits <= 0.0 {
            return 0.0;
        }
        (self.current_spend / self.budget_credits) * 100.0
    }
}

/// Alert thresholds created alongside every budget.
pub const ALERT_THRESHOLDS: [u8; 4] = [50, 75, 90, 100];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub budget_id: BudgetId,
    pub threshold_percent: u8,
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAdmission {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<BudgetId>,
    pub current_spend: f64,
    pub budget_limit: f64,
    pub percentage_used: f64,
}

impl BudgetAdmission {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            reason: None,
            budget_id: None,
            current_spend: 0.0,
            budget_limit: 0.0,
            percentage_used: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_used_handles_zero_limit() {
        let budget = Budget {
            id: BudgetId::generate(),
            name: "zero".to_string(),
            scope: BudgetScope::Global,
            scope_id: None,
            budget_credits: 0.0,
            period: BudgetPeriod::Total,
            period_start: Utc::now(),
            period_end: None,
            current_spend: 10.0,
            enabled: true,
            enforce_limit: true,
        };
        assert_eq!(budget.percentage_used(), 0.0);
    }
}
