use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use toolgrid::args::CliArgs;
use toolgrid::config::ConfigBuilder;
use toolgrid::gateway::Gateway;
use toolgrid::run_server;
use utils::context::AppContext;

fn main() -> Result<()> {
    let config = ConfigBuilder::new(CliArgs::parse()).build()?;

    // fail before any sockets open if the deployment contract is unmet
    config.master_api_key()?;

    match &config.otel_collector {
        Some(collector) => {
            utils::telemetry::setup_tracing(collector, "toolgrid", config.tracing_env_filter()?);
            utils::telemetry::setup_metrics(collector, "toolgrid");
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(config.tracing_env_filter()?)
                .init();
        }
    }

    tracing::info!(
        data = %config.data.display(),
        db = %config.database_path().display(),
        "starting toolgrid"
    );

    // instruments bind to whatever meter provider is installed above;
    // without a collector they are no-ops with the same call sites
    let meter = opentelemetry::global::meter("toolgrid");
    let metrics = utils::telemetry::Metrics::init(&meter);

    let ctx = AppContext::new(config.worker_threads);
    let (gateway, webhook_worker) = Gateway::new(&config, metrics)?;

    run_server(ctx, config, Arc::new(gateway), webhook_worker);

    Ok(())
}
