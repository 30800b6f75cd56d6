mod common;

use std::time::Duration;

use serde_json::json;

use common::{build_gateway, upstream_server, MockUpstream};
use toolgrid::init_tracing_tests;
use toolgrid_types::{
    ErrorCode, ExecutionStatus, RequestContext, Step, StepType, WorkflowDefinition,
};
use utils::context::AppContext;

#[test]
fn invoke_flows_through_registry_admission_and_upstream() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    ctx.rt.clone().block_on(async move {
        let (upstream, url) = MockUpstream::spawn().await;
        let (gateway, _worker, _config) = build_gateway(tmp.path());

        let server = upstream_server("weather", &url, 2);
        gateway.server_store.insert(&server).unwrap();
        gateway.connect_server(&server.id).await.unwrap();

        // the catalog landed in the registries
        let tool = gateway.registries.tools.find("weather/current").unwrap();
        assert_eq!(tool.server_id, server.id);
        assert_eq!(gateway.registries.tools.count(), 2);
        assert_eq!(gateway.registries.prompts.count(), 1);
        assert_eq!(gateway.registries.resources.count(), 1);

        // a successful invocation round-trips to the upstream
        let request = RequestContext::system();
        let outcome = gateway
            .router
            .invoke(&request, "weather/current", json!({"city": "Paris"}))
            .await;
        assert!(outcome.success, "unexpected failure: {:?}", outcome.error);
        assert_eq!(outcome.data.as_ref().unwrap()["echo"]["city"], "Paris");
        assert_eq!(upstream.tool_calls(), 1);

        // usage counter and audit row followed
        assert_eq!(
            gateway
                .registries
                .tools
                .find("weather/current")
                .unwrap()
                .usage_count,
            1
        );
        let audited = gateway
            .audit_store
            .query(&toolgrid_types::AuditQuery {
                action: Some("tool.invoke".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(audited.len(), 1);
        assert!(audited[0].success);

        // per-minute cap of 2: the second call passes, the third is denied
        let second = gateway
            .router
            .invoke(&request, "weather/current", json!({}))
            .await;
        assert!(second.success);
        let third = gateway
            .router
            .invoke(&request, "weather/current", json!({}))
            .await;
        assert!(!third.success);
        assert_eq!(third.code, Some(ErrorCode::RateLimited));
        assert!(third.retry_after_ms.unwrap() <= 60_000);
        // the denied call never reached the upstream
        assert_eq!(upstream.tool_calls(), 2);

        // unknown tools are reported, not routed
        let missing = gateway
            .router
            .invoke(&request, "weather/nope", json!({}))
            .await;
        assert!(!missing.success);
        assert_eq!(missing.code, Some(ErrorCode::NotFound));
    });
}

#[test]
fn batch_items_fail_independently() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    ctx.rt.clone().block_on(async move {
        let (upstream, url) = MockUpstream::spawn().await;
        let (gateway, _worker, _config) = build_gateway(tmp.path());

        let server = upstream_server("weather", &url, 0);
        gateway.server_store.insert(&server).unwrap();
        gateway.connect_server(&server.id).await.unwrap();

        // first tools/call fails, second succeeds
        upstream
            .fail_tool_times
            .store(1, std::sync::atomic::Ordering::SeqCst);

        let request = RequestContext::system();
        let outcomes = gateway
            .router
            .invoke_batch(
                &request,
                vec![
                    serde_json::from_value(json!({"name": "weather/current", "params": {}}))
                        .unwrap(),
                    serde_json::from_value(json!({"name": "weather/forecast", "params": {}}))
                        .unwrap(),
                ],
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        // results come back in input order with independent outcomes
        assert_eq!(outcomes[0].tool_name, "weather/current");
        assert_eq!(outcomes[1].tool_name, "weather/forecast");
        assert_eq!(
            outcomes.iter().filter(|o| o.success).count(),
            1,
            "exactly one item should fail"
        );
    });
}

#[test]
fn server_delete_tears_everything_down() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    ctx.rt.clone().block_on(async move {
        let (_upstream, url) = MockUpstream::spawn().await;
        let (gateway, _worker, _config) = build_gateway(tmp.path());

        let server = upstream_server("weather", &url, 5);
        gateway.server_store.insert(&server).unwrap();
        gateway.connect_server(&server.id).await.unwrap();
        assert!(gateway.registries.tools.count() > 0);
        assert!(gateway.pool.client(&server.id).is_some());

        assert!(gateway.delete_server(&server.id).await.unwrap());

        assert_eq!(gateway.registries.tools.count(), 0);
        assert!(gateway.pool.client(&server.id).is_none());
        assert!(gateway.server_store.get(&server.id).unwrap().is_none());
        assert!(gateway.limiter.snapshot(&server.id).is_none());
    });
}

#[test]
fn workflow_executes_with_templating_and_persists_steps() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (_upstream, url) = MockUpstream::spawn().await;
        let (gateway, _worker, _config) = build_gateway(tmp.path());

        let server = upstream_server("weather", &url, 0);
        gateway.server_store.insert(&server).unwrap();
        gateway.connect_server(&server.id).await.unwrap();

        let definition = WorkflowDefinition {
            name: "fetch-and-report".to_string(),
            description: None,
            steps: vec![
                Step {
                    name: "fetch".to_string(),
                    step_type: StepType::Tool,
                    config: json!({
                        "tool": "weather/current",
                        "params": {"city": "{{ input.city }}"}
                    }),
                    on_error: None,
                    retry_config: None,
                    condition: None,
                },
                Step {
                    name: "report".to_string(),
                    step_type: StepType::Prompt,
                    config: json!({
                        "prompt": "weather/summary",
                        "arguments": {"data": "{{ steps.fetch.output }}"}
                    }),
                    on_error: None,
                    retry_config: None,
                    condition: None,
                },
            ],
            error_handling: Default::default(),
            timeout_ms: Some(30_000),
        };

        let workflow = gateway.workflow_store.insert("daily", &definition).unwrap();
        let request = RequestContext::system();
        let execution = gateway
            .workflow_manager
            .start(&app, &request, &workflow.id, json!({"city": "Paris"}))
            .unwrap();

        // the run continues in the background; poll it to completion
        let mut finished = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (row, steps) = gateway
                .workflow_manager
                .get_execution(&execution.id)
                .unwrap()
                .unwrap();
            if row.status.is_terminal() {
                finished = Some((row, steps));
                break;
            }
        }

        let (row, steps) = finished.expect("execution did not finish in time");
        assert_eq!(row.status, ExecutionStatus::Completed, "error: {:?}", row.error);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "fetch");
        assert_eq!(steps[1].name, "report");

        // the fetch step saw the interpolated city
        let fetch_input = steps[0].input.as_ref().unwrap();
        assert_eq!(fetch_input["params"]["city"], "Paris");

        // the report step received the fetch output as a structured
        // value (rendered JSON re-parsed), not a string
        let report_input = steps[1].input.as_ref().unwrap();
        assert!(report_input["arguments"]["data"].is_object());
    });
}
