use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use toolgrid_types::{Budget, BudgetId, BudgetPeriod, BudgetScope, RequestContext};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateBudgetRequest {
    pub name: String,
    pub scope: BudgetScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub budget_credits: f64,
    pub period: BudgetPeriod,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub enforce_limit: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBudgetRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub budget_credits: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub enforce_limit: Option<bool>,
}

#[utoipa::path(post, path = "/budgets", responses((status = 200, description = "Budget created")))]
#[axum::debug_handler]
pub async fn handle_create_budget(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateBudgetRequest>,
) -> HttpResult<Json<Envelope<Budget>>> {
    if req.budget_credits <= 0.0 {
        return Err(HttpError::validation("budgetCredits must be positive"));
    }
    if req.scope != BudgetScope::Global && req.scope_id.is_none() {
        return Err(HttpError::validation(format!(
            "scopeId is required for {} budgets",
            req.scope.as_str()
        )));
    }

    let budget = state.gateway.budget.create_budget(
        &req.name,
        req.scope,
        req.scope_id.as_deref(),
        req.budget_credits,
        req.period,
        req.enabled,
        req.enforce_limit,
    )?;
    Ok(Envelope::ok(budget, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/budgets", responses((status = 200, description = "List budgets")))]
#[axum::debug_handler]
pub async fn handle_list_budgets(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<Envelope<Vec<Budget>>>> {
    Ok(Envelope::ok(
        state.gateway.budget.list_budgets()?,
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/budgets/{id}/status", responses((status = 200, description = "Budget with alert state")))]
#[axum::debug_handler]
pub async fn handle_budget_status(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<BudgetId>,
) -> HttpResult<impl IntoResponse> {
    let (budget, alerts) = state
        .gateway
        .budget
        .get_status(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Budget not found: {id}")))?;

    let percentage_used = budget.percentage_used();
    Ok(Envelope::ok(
        json!({
            "budget": budget,
            "alerts": alerts,
            "percentageUsed": percentage_used,
        }),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(put, path = "/budgets/{id}", responses((status = 200, description = "Budget updated")))]
#[axum::debug_handler]
pub async fn handle_update_budget(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<BudgetId>,
    Json(req): Json<UpdateBudgetRequest>,
) -> HttpResult<Json<Envelope<Budget>>> {
    let budget = state.gateway.budget.update_budget(
        &id,
        req.name.as_deref(),
        req.budget_credits,
        req.enabled,
        req.enforce_limit,
    )?;
    Ok(Envelope::ok(budget, Some(ctx.request_id)))
}

#[utoipa::path(delete, path = "/budgets/{id}", responses((status = 200, description = "Budget deleted")))]
#[axum::debug_handler]
pub async fn handle_delete_budget(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<BudgetId>,
) -> HttpResult<impl IntoResponse> {
    if !state.gateway.budget.delete_budget(&id)? {
        return Err(HttpError::not_found(format!("Budget not found: {id}")));
    }
    Ok(Envelope::ok(json!({"deleted": true}), Some(ctx.request_id)))
}
