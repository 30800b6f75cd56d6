use utoipa::OpenApi;

use super::{
    audit, budgets, keys, monitor, prompts, resources, search, servers, tools, usage, webhooks,
    workflows,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Toolgrid Gateway API",
        description = "Federated tool-invocation gateway: unified tool/resource/prompt listings, routed invocations, workflows, budgets, and webhooks."
    ),
    paths(
        servers::handle_create_server,
        servers::handle_list_servers,
        servers::handle_get_server,
        servers::handle_update_server,
        servers::handle_delete_server,
        servers::handle_connect_server,
        servers::handle_disconnect_server,
        servers::handle_server_tools,
        servers::handle_create_group,
        servers::handle_list_groups,
        tools::handle_list_tools,
        tools::handle_invoke_tool,
        tools::handle_invoke_batch,
        resources::handle_list_resources,
        resources::handle_read_resource,
        prompts::handle_list_prompts,
        prompts::handle_get_prompt,
        search::handle_search,
        search::handle_reindex,
        workflows::handle_create_workflow,
        workflows::handle_list_workflows,
        workflows::handle_get_workflow,
        workflows::handle_update_workflow,
        workflows::handle_delete_workflow,
        workflows::handle_execute_workflow,
        workflows::handle_list_executions,
        workflows::handle_get_execution,
        workflows::handle_cancel_execution,
        workflows::handle_export_workflow,
        workflows::handle_import_workflow,
        webhooks::handle_create_subscription,
        webhooks::handle_list_subscriptions,
        webhooks::handle_get_subscription,
        webhooks::handle_update_subscription,
        webhooks::handle_delete_subscription,
        webhooks::handle_test_subscription,
        webhooks::handle_list_deliveries,
        webhooks::handle_delivery_stats,
        budgets::handle_create_budget,
        budgets::handle_list_budgets,
        budgets::handle_budget_status,
        budgets::handle_update_budget,
        budgets::handle_delete_budget,
        keys::handle_create_key,
        keys::handle_list_keys,
        keys::handle_update_key,
        audit::handle_query_audit,
        audit::handle_export_audit,
        audit::handle_cleanup_audit,
        usage::handle_query_usage,
        usage::handle_usage_summary,
        usage::handle_export_usage,
        usage::handle_cleanup_usage,
        monitor::handle_health,
        monitor::handle_monitor_health,
        monitor::handle_monitor_breakers,
        monitor::handle_force_open,
        monitor::handle_force_close,
        monitor::handle_monitor_rate_limits,
        monitor::handle_reset_rate_limit,
        monitor::handle_reset_all_rate_limits,
        monitor::handle_monitor_metrics,
    )
)]
pub struct ApiDoc;
