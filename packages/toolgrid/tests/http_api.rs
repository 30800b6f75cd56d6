mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use common::build_gateway;
use toolgrid::http::server::make_router;
use toolgrid::init_tracing_tests;
use utils::context::AppContext;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn requests_without_a_key_are_rejected() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app_ctx = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (gateway, _worker, config) = build_gateway(tmp.path());
        let router = make_router(config, gateway, app_ctx).unwrap();

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "UNAUTHENTICATED");

        // a wrong key is also rejected
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/tools")
                    .header("x-api-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    });
}

#[test]
fn health_is_public_and_tools_need_auth() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app_ctx = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (gateway, _worker, config) = build_gateway(tmp.path());
        let router = make_router(config, gateway, app_ctx).unwrap();

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/tools")
                    .header("authorization", "Bearer test-master-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["data"].as_array().unwrap().is_empty());
        assert!(body["requestId"].is_string());
    });
}

#[test]
fn server_crud_over_http() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app_ctx = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (gateway, _worker, config) = build_gateway(tmp.path());
        let router = make_router(config, gateway.clone(), app_ctx).unwrap();

        let create = Request::builder()
            .method("POST")
            .uri("/servers")
            .header("authorization", "Bearer test-master-key")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "name": "weather",
                    "transport": {"type": "http", "url": "http://localhost:1"},
                    "rateLimits": {"perMinute": 3, "perDay": 10}
                })
                .to_string(),
            ))
            .unwrap();
        let response = router.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["data"]["name"], "weather");
        let server_id = body["data"]["id"].as_str().unwrap().to_string();

        // a duplicate name conflicts
        let duplicate = Request::builder()
            .method("POST")
            .uri("/servers")
            .header("authorization", "Bearer test-master-key")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "name": "weather",
                    "transport": {"type": "http", "url": "http://localhost:2"}
                })
                .to_string(),
            ))
            .unwrap();
        let response = router.clone().oneshot(duplicate).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // the audit trail recorded the creation
        let audited = gateway
            .audit_store
            .query(&toolgrid_types::AuditQuery {
                action: Some("server.create".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(audited.len(), 1);

        // delete round-trips
        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/servers/{server_id}"))
            .header("authorization", "Bearer test-master-key")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let missing = Request::builder()
            .uri(format!("/servers/{server_id}"))
            .header("authorization", "Bearer test-master-key")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    });
}

#[test]
fn unknown_endpoints_return_the_envelope() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app_ctx = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (gateway, _worker, config) = build_gateway(tmp.path());
        let router = make_router(config, gateway, app_ctx).unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/definitely-not-a-route")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "NOT_FOUND");
    });
}
