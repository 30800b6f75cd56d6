use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post, put},
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use wildmatch::WildMatch;

use crate::config::Config;
use crate::gateway::Gateway;
use utils::context::AppContext;

use super::handlers::{
    audit, budgets, handle_not_found, keys, monitor, openapi::ApiDoc, prompts, resources, search,
    servers, tools, usage, webhooks, workflows,
};
use super::state::{authenticate, HttpState};

// this is called from main, takes the fully wired gateway
pub fn start(ctx: AppContext, config: Config, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    // The server runs within the tokio runtime
    ctx.rt.clone().block_on(async move {
        let (host, port) = (config.host.clone(), config.port);

        let mut shutdown_signal = ctx.get_kill_receiver();

        let router = make_router(config, gateway, ctx.clone())?;

        let listener = tokio::net::TcpListener::bind(&format!("{}:{}", host, port)).await?;

        tracing::info!("Http server starting on: {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.recv().await.ok();

                tracing::debug!("Http server shutting down");
            })
            .await?;

        anyhow::Ok(())
    })?;

    Ok(())
}

// this is called from main and tests
pub fn make_router(
    config: Config,
    gateway: Arc<Gateway>,
    app: AppContext,
) -> anyhow::Result<axum::Router> {
    let state = HttpState::new(config.clone(), gateway, app)?;

    // public routes: liveness probe and the OpenAPI surface
    let public = axum::Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(monitor::handle_health));

    // everything else requires an API key
    let protected = axum::Router::new()
        .route("/servers", post(servers::handle_create_server))
        .route("/servers", get(servers::handle_list_servers))
        .route("/servers/groups", post(servers::handle_create_group))
        .route("/servers/groups", get(servers::handle_list_groups))
        .route("/servers/{id}", get(servers::handle_get_server))
        .route("/servers/{id}", put(servers::handle_update_server))
        .route("/servers/{id}", delete(servers::handle_delete_server))
        .route("/servers/{id}/connect", post(servers::handle_connect_server))
        .route(
            "/servers/{id}/disconnect",
            post(servers::handle_disconnect_server),
        )
        .route("/servers/{id}/tools", get(servers::handle_server_tools))
        .route("/tools", get(tools::handle_list_tools))
        .route("/tools/invoke", post(tools::handle_invoke_tool))
        .route("/tools/invoke-batch", post(tools::handle_invoke_batch))
        .route("/resources", get(resources::handle_list_resources))
        .route("/resources/read", post(resources::handle_read_resource))
        .route("/prompts", get(prompts::handle_list_prompts))
        .route("/prompts/get", post(prompts::handle_get_prompt))
        .route("/search", post(search::handle_search))
        .route("/search/reindex", post(search::handle_reindex))
        .route("/workflows", post(workflows::handle_create_workflow))
        .route("/workflows", get(workflows::handle_list_workflows))
        .route(
            "/workflows/executions",
            get(workflows::handle_list_executions),
        )
        .route(
            "/workflows/executions/{id}",
            get(workflows::handle_get_execution),
        )
        .route(
            "/workflows/executions/{id}/cancel",
            post(workflows::handle_cancel_execution),
        )
        .route("/workflows/import", post(workflows::handle_import_workflow))
        .route("/workflows/{id}", get(workflows::handle_get_workflow))
        .route("/workflows/{id}", put(workflows::handle_update_workflow))
        .route("/workflows/{id}", delete(workflows::handle_delete_workflow))
        .route(
            "/workflows/{id}/execute",
            post(workflows::handle_execute_workflow),
        )
        .route(
            "/workflows/{id}/export",
            get(workflows::handle_export_workflow),
        )
        .route(
            "/webhooks/subscriptions",
            post(webhooks::handle_create_subscription),
        )
        .route(
            "/webhooks/subscriptions",
            get(webhooks::handle_list_subscriptions),
        )
        .route(
            "/webhooks/subscriptions/{id}",
            get(webhooks::handle_get_subscription),
        )
        .route(
            "/webhooks/subscriptions/{id}",
            put(webhooks::handle_update_subscription),
        )
        .route(
            "/webhooks/subscriptions/{id}",
            delete(webhooks::handle_delete_subscription),
        )
        .route(
            "/webhooks/subscriptions/{id}/test",
            post(webhooks::handle_test_subscription),
        )
        .route(
            "/webhooks/deliveries",
            get(webhooks::handle_list_deliveries),
        )
        .route("/webhooks/stats", get(webhooks::handle_delivery_stats))
        .route("/budgets", post(budgets::handle_create_budget))
        .route("/budgets", get(budgets::handle_list_budgets))
        .route("/budgets/{id}", put(budgets::handle_update_budget))
        .route("/budgets/{id}", delete(budgets::handle_delete_budget))
        .route("/budgets/{id}/status", get(budgets::handle_budget_status))
        .route("/keys", post(keys::handle_create_key))
        .route("/keys", get(keys::handle_list_keys))
        .route("/keys/{id}", put(keys::handle_update_key))
        .route("/audit", get(audit::handle_query_audit))
        .route("/audit/export", get(audit::handle_export_audit))
        .route("/audit/cleanup", post(audit::handle_cleanup_audit))
        .route("/usage", get(usage::handle_query_usage))
        .route("/usage/summary", get(usage::handle_usage_summary))
        .route("/usage/export", get(usage::handle_export_usage))
        .route("/usage/cleanup", post(usage::handle_cleanup_usage))
        .route("/monitor/health", get(monitor::handle_monitor_health))
        .route(
            "/monitor/circuit-breakers",
            get(monitor::handle_monitor_breakers),
        )
        .route(
            "/monitor/circuit-breakers/{id}/force-open",
            post(monitor::handle_force_open),
        )
        .route(
            "/monitor/circuit-breakers/{id}/force-close",
            post(monitor::handle_force_close),
        )
        .route(
            "/monitor/rate-limits",
            get(monitor::handle_monitor_rate_limits),
        )
        .route(
            "/monitor/rate-limits/reset",
            post(monitor::handle_reset_all_rate_limits),
        )
        .route(
            "/monitor/rate-limits/{id}/reset",
            post(monitor::handle_reset_rate_limit),
        )
        .route("/monitor/metrics", get(monitor::handle_monitor_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let mut router = public
        .merge(protected)
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(OtelAxumLayer::default())
        .with_state(state);

    if let Some(cors) = cors_layer(&config) {
        router = router.layer(cors);
    }

    Ok(router)
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        None
    } else {
        let allowed_origins: Vec<WildMatch> = config
            .cors_allowed_origins
            .iter()
            .map(|s| WildMatch::new(s))
            .collect();

        Some(
            CorsLayer::new()
                // using a predicate so we have more flexibility over wildcard patterns
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    move |origin, _parts| {
                        origin
                            .to_str()
                            .map(|origin| {
                                allowed_origins
                                    .iter()
                                    .any(|allowed_origin| allowed_origin.matches(origin))
                            })
                            .unwrap_or(false)
                    },
                ))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
    }
}
