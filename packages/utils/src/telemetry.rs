use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    resource::Resource,
    trace::{self, Sampler, SdkTracerProvider},
};
use tracing_subscriber::layer::SubscriberExt;

pub fn setup_tracing(
    collector: &str,
    service_name: &str,
    filters: tracing_subscriber::EnvFilter,
) -> SdkTracerProvider {
    global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new());
    let endpoint = format!("{}/v1/traces", collector);
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter");

    let batch_processor = trace::BatchSpanProcessor::builder(exporter).build();

    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch_processor)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(format!("{}-tracer", service_name));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let subscriber = tracing_subscriber::Registry::default()
        .with(filters)
        .with(tracing_subscriber::fmt::layer()) // console logging layer
        .with(telemetry);

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    tracing::info!("OTLP tracing enabled");
    provider
}

pub fn setup_metrics(collector: &str, service_name: &str) -> SdkMeterProvider {
    let endpoint = format!("{}/api/v1/otlp/v1/metrics", collector);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter!");

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .with_periodic_exporter(exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    tracing::info!("Metrics enabled and exporting to {}", collector);

    meter_provider
}

use opentelemetry::metrics::{Counter, Gauge, Meter, UpDownCounter};

pub struct Metrics {
    pub http: HttpMetrics,
    pub gateway: GatewayMetrics,
}

impl Metrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            http: HttpMetrics::init(meter),
            gateway: GatewayMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    pub registered_servers: UpDownCounter<i64>,
}

impl HttpMetrics {
    pub const LABEL: &'static str = "http";

    pub fn init(meter: &Meter) -> Self {
        HttpMetrics {
            registered_servers: meter
                .i64_up_down_counter(format!("{}_registered_servers", Self::LABEL))
                .with_description("Number of upstream servers currently registered")
                .build(),
        }
    }

    pub fn increment_registered_servers(&self) {
        self.registered_servers.add(1, &[]);
    }

    pub fn decrement_registered_servers(&self) {
        self.registered_servers.add(-1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    pub pool: PoolMetrics,
    pub router: RouterMetrics,
    pub workflow: WorkflowMetrics,
    pub webhook: WebhookMetrics,
}

impl GatewayMetrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            pool: PoolMetrics::init(meter),
            router: RouterMetrics::init(meter),
            workflow: WorkflowMetrics::init(meter),
            webhook: WebhookMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolMetrics {
    pub active_connections: Gauge<u64>,
    pub total_errors: Counter<u64>,
}

impl PoolMetrics {
    pub const LABEL: &'static str = "pool";

    pub fn init(meter: &Meter) -> Self {
        Self {
            active_connections: meter
                .u64_gauge(format!("{}_active_connections", Self::LABEL))
                .with_description("Current number of connected upstreams")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn record_active_connections(&self, count: u64) {
        self.active_connections.record(count, &[]);
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct RouterMetrics {
    pub total_invocations: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl RouterMetrics {
    pub const LABEL: &'static str = "router";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_invocations: meter
                .u64_counter(format!("{}_total_invocations", Self::LABEL))
                .with_description("Total number of tool invocations routed")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn increment_total_invocations(&self, outcome: &str) {
        self.total_invocations
            .add(1, &[KeyValue::new("outcome", outcome.to_owned())]);
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct WorkflowMetrics {
    pub total_executions: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl WorkflowMetrics {
    pub const LABEL: &'static str = "workflow";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_executions: meter
                .u64_counter(format!("{}_total_executions", Self::LABEL))
                .with_description("Total number of workflow executions started")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn increment_total_executions(&self) {
        self.total_executions.add(1, &[]);
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct WebhookMetrics {
    pub total_deliveries: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl WebhookMetrics {
    pub const LABEL: &'static str = "webhook";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_deliveries: meter
                .u64_counter(format!("{}_total_deliveries", Self::LABEL))
                .with_description("Total number of webhook deliveries attempted")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn increment_total_deliveries(&self, outcome: &str) {
        self.total_deliveries
            .add(1, &[KeyValue::new("outcome", outcome.to_owned())]);
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}
