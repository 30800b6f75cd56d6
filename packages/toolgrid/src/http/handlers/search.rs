use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use toolgrid_types::{EntityType, RequestContext, SearchHit};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;
use crate::registry::semantic::SearchOptions;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub types: Vec<EntityType>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub threshold: Option<f32>,
}

#[utoipa::path(post, path = "/search", responses((status = 200, description = "Semantic search hits")))]
#[axum::debug_handler]
pub async fn handle_search(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<SearchRequest>,
) -> HttpResult<Json<Envelope<Vec<SearchHit>>>> {
    if req.query.trim().is_empty() {
        return Err(HttpError::validation("query must not be empty"));
    }

    let defaults = SearchOptions::default();
    let hits = state
        .gateway
        .semantic
        .search(
            &state.gateway.registries,
            &req.query,
            SearchOptions {
                types: req.types,
                limit: req.limit.unwrap_or(defaults.limit),
                threshold: req.threshold.unwrap_or(defaults.threshold),
            },
        )
        .await?;

    Ok(Envelope::ok(hits, Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/search/reindex", responses((status = 200, description = "Reindex summary")))]
#[axum::debug_handler]
pub async fn handle_reindex(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let indexed = state
        .gateway
        .semantic
        .reindex_all(&state.gateway.registries)
        .await?;
    Ok(Envelope::ok(json!({"indexed": indexed}), Some(ctx.request_id)))
}
