#![allow(clippy::uninlined_format_args)]
#![allow(clippy::type_complexity)]

pub mod admission;
pub mod args;
pub mod budget;
pub mod config;
pub mod events;
pub mod gateway; // where we have the high-level composition root
pub mod health;
pub mod http;
pub mod pool;
pub mod registry;
pub mod router;
pub mod storage;
pub mod webhook;
pub mod workflow;

use std::sync::Arc;

use config::Config;
use gateway::Gateway;
use health::HealthChecker;
use utils::context::AppContext;
use webhook::WebhookWorker;

/// Entry point to start up the whole server
/// Called from main and end-to-end tests
pub fn run_server(
    ctx: AppContext,
    config: Config,
    gateway: Arc<Gateway>,
    webhook_worker: WebhookWorker,
) {
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    // background subsystems share the runtime and the kill switch
    webhook_worker.start(&ctx);

    HealthChecker::new(
        gateway.pool.clone(),
        gateway.server_store.clone(),
        gateway.breakers.clone(),
        gateway.health_status.clone(),
    )
    .start(&ctx);

    // bring persisted servers back online before accepting traffic
    ctx.rt.block_on({
        let gateway = gateway.clone();
        async move {
            gateway.autoconnect().await;
        }
    });

    // the http server owns the calling thread until shutdown
    http::server::start(ctx.clone(), config, gateway.clone()).unwrap();

    // drain upstream connections after the listener stops
    ctx.rt.block_on(async move {
        gateway.pool.disconnect_all().await;
    });
}

// the test version of init_tracing does not take a config
// since config itself is tested and modified from different parallel tests
// therefore, this only uses the default tracing settings
// it's not gated out because it is used in integration tests as well
pub fn init_tracing_tests() {
    use std::sync::LazyLock;

    // ensure we only initialize once across parallel test threads
    static INIT: LazyLock<std::sync::Mutex<bool>> = LazyLock::new(|| std::sync::Mutex::new(false));

    let mut init = INIT.lock().unwrap();

    if !*init {
        *init = true;

        tracing_subscriber::fmt::init();
        tracing::debug!("Tracing initialized for tests");
    }
}
