use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use toolgrid_types::{Principal, RequestContext};
use utils::context::AppContext;
use utils::http::auth::presented_api_key;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::http::error::HttpError;
use toolgrid_types::ErrorCode;

#[derive(Clone)]
pub struct HttpState {
    pub config: Config,
    pub gateway: Arc<Gateway>,
    pub app: AppContext,
    pub master_api_key: String,
}

impl HttpState {
    pub fn new(config: Config, gateway: Arc<Gateway>, app: AppContext) -> anyhow::Result<Self> {
        let master_api_key = config.master_api_key()?.to_string();
        Ok(Self {
            config,
            gateway,
            app,
            master_api_key,
        })
    }
}

/// Resolves the presented key to a [`Principal`] (master key or an
/// enabled stored API key) and attaches a fresh [`RequestContext`] to
/// the request. Everything behind this middleware can assume both.
pub async fn authenticate(
    State(state): State<HttpState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(key) = presented_api_key(&req) else {
        return HttpError::new(ErrorCode::Unauthenticated, "Missing API key").into_response();
    };

    let principal = if key == state.master_api_key {
        Principal::master()
    } else {
        match state.gateway.api_key_store.authenticate(&key) {
            Ok(Some(record)) => Principal {
                api_key_id: Some(record.id),
                tenant_id: record.tenant_id,
                is_master: false,
            },
            Ok(None) => {
                return HttpError::new(ErrorCode::Unauthenticated, "Invalid API key")
                    .into_response();
            }
            Err(err) => {
                tracing::error!(?err, "api key lookup failed");
                return HttpError::new(ErrorCode::Internal, "auth backend unavailable")
                    .into_response();
            }
        }
    };

    let ctx = RequestContext::new(principal);
    req.extensions_mut().insert(ctx);
    next.run(req).await
}
