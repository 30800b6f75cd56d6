mod common;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Router};

use common::build_gateway;
use toolgrid::init_tracing_tests;
use toolgrid_types::{
    DeliveryStatus, GatewayEvent, ServerId, SubscriptionId, WebhookSubscription,
};
use utils::context::AppContext;

/// Endpoint that fails with 500 a configured number of times, then 200.
#[derive(Clone)]
struct FlakyHook {
    hits: Arc<AtomicU32>,
    fail_times: u32,
    last_signature: Arc<std::sync::Mutex<Option<String>>>,
}

async fn hook_handler(
    State(hook): State<FlakyHook>,
    headers: axum::http::HeaderMap,
    _body: String,
) -> (StatusCode, &'static str) {
    let hit = hook.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(signature) = headers.get("x-signature") {
        *hook.last_signature.lock().unwrap() = signature.to_str().ok().map(str::to_string);
    }
    if hit <= hook.fail_times {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom")
    } else {
        (StatusCode::OK, "ok")
    }
}

async fn spawn_hook(fail_times: u32) -> (FlakyHook, String) {
    let hook = FlakyHook {
        hits: Arc::new(AtomicU32::new(0)),
        fail_times,
        last_signature: Arc::new(std::sync::Mutex::new(None)),
    };
    let app = Router::new()
        .route("/hook", post(hook_handler))
        .with_state(hook.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (hook, url)
}

fn subscription(url: &str) -> WebhookSubscription {
    WebhookSubscription {
        id: SubscriptionId::generate(),
        name: "ops".to_string(),
        url: url.to_string(),
        events: vec!["server.connected".to_string()],
        secret: Some("hook-secret".to_string()),
        enabled: true,
        server_filter: Vec::new(),
        retry_count: 3,
        retry_delay_ms: 10,
        timeout_ms: 2_000,
    }
}

#[test]
fn delivery_retries_until_success() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (hook, url) = spawn_hook(3).await;
        let (gateway, worker, _config) = build_gateway(tmp.path());
        worker.start(&app);

        gateway
            .webhooks
            .create_subscription(&subscription(&url))
            .unwrap();

        gateway.events.publish(GatewayEvent::ServerConnected {
            server_id: ServerId::new("srv-hook").unwrap(),
            server_name: "hooked".to_string(),
        });

        // 3 failures + 1 success with 10ms base delay lands well inside this window
        let mut delivery = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let rows = gateway.webhooks.get_deliveries(None, 10, 0).unwrap();
            if let Some(row) = rows.first() {
                if row.status != DeliveryStatus::Pending {
                    delivery = Some(row.clone());
                    break;
                }
            }
        }

        let delivery = delivery.expect("delivery did not reach a terminal state");
        assert_eq!(delivery.status, DeliveryStatus::Success);
        assert_eq!(delivery.status_code, Some(200));
        assert_eq!(delivery.attempt, 4);
        assert_eq!(hook.hits.load(Ordering::SeqCst), 4);

        // signed, since the subscription has a secret
        let signature = hook.last_signature.lock().unwrap().clone().unwrap();
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);

        let stats = gateway.webhooks.get_stats().unwrap();
        assert_eq!(stats.success, 1);
    });
}

#[test]
fn exhausted_retries_mark_failed() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app = ctx.clone();
    ctx.rt.clone().block_on(async move {
        // always fails: more failures than retry_count + 1 attempts
        let (hook, url) = spawn_hook(100).await;
        let (gateway, worker, _config) = build_gateway(tmp.path());
        worker.start(&app);

        let mut sub = subscription(&url);
        sub.retry_count = 2;
        gateway.webhooks.create_subscription(&sub).unwrap();

        gateway.events.publish(GatewayEvent::ServerConnected {
            server_id: ServerId::new("srv-hook").unwrap(),
            server_name: "hooked".to_string(),
        });

        let mut delivery = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let rows = gateway.webhooks.get_deliveries(None, 10, 0).unwrap();
            if let Some(row) = rows.first() {
                if row.status != DeliveryStatus::Pending {
                    delivery = Some(row.clone());
                    break;
                }
            }
        }

        let delivery = delivery.expect("delivery did not reach a terminal state");
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        // retry_count + 1 attempts, no more
        assert_eq!(delivery.attempt, 3);
        assert_eq!(hook.hits.load(Ordering::SeqCst), 3);
    });
}

#[test]
fn events_outside_the_subscription_are_ignored() {
    init_tracing_tests();
    let ctx = AppContext::new(Some(2));
    let tmp = tempfile::tempdir().unwrap();

    let app = ctx.clone();
    ctx.rt.clone().block_on(async move {
        let (hook, url) = spawn_hook(0).await;
        let (gateway, worker, _config) = build_gateway(tmp.path());
        worker.start(&app);

        let mut sub = subscription(&url);
        // only disconnects; the connected event below must not match
        sub.events = vec!["server.disconnected".to_string()];
        gateway.webhooks.create_subscription(&sub).unwrap();

        gateway.events.publish(GatewayEvent::ServerConnected {
            server_id: ServerId::new("srv-hook").unwrap(),
            server_name: "hooked".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hook.hits.load(Ordering::SeqCst), 0);
        assert!(gateway.webhooks.get_deliveries(None, 10, 0).unwrap().is_empty());
    });
}
