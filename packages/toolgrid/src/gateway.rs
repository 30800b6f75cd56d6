use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use toolgrid_engine::{EngineConfig, WorkflowEngine};
use toolgrid_types::{ConnectionStatus, ErrorCode, ServerId};

use crate::admission::breaker::{BreakerConfig, CircuitBreakers};
use crate::admission::rate_limit::RateLimiter;
use crate::budget::BudgetEnforcer;
use crate::config::Config;
use crate::events::EventBus;
use crate::health::{create_shared_health_status, SharedHealthStatus};
use crate::pool::{error::PoolError, ConnectionPool};
use crate::registry::embedder::{Embedder, HttpEmbedder};
use crate::registry::semantic::SemanticIndex;
use crate::registry::Registries;
use crate::router::Router;
use crate::storage::api_keys::ApiKeyStore;
use crate::storage::audit::AuditStore;
use crate::storage::budgets::BudgetStore;
use crate::storage::embeddings::EmbeddingStore;
use crate::storage::executions::ExecutionStore;
use crate::storage::servers::ServerStore;
use crate::storage::usage::UsageStore;
use crate::storage::webhooks::WebhookStore;
use crate::storage::workflows::WorkflowStore;
use crate::storage::{migrations, Db, StorageError};
use crate::webhook::{WebhookService, WebhookWorker};
use crate::workflow::host::GatewayStepHost;
use crate::workflow::sampling::{DisabledSampler, SamplingProvider};
use crate::workflow::WorkflowManager;
use utils::telemetry::{HttpMetrics, Metrics};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Server not found: {0}")]
    ServerNotFound(ServerId),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::ServerNotFound(_) => ErrorCode::NotFound,
            GatewayError::Storage(StorageError::NotFound(_)) => ErrorCode::NotFound,
            GatewayError::Storage(StorageError::Conflict(_)) => ErrorCode::Conflict,
            GatewayError::Storage(StorageError::Retention(_)) => ErrorCode::Validation,
            GatewayError::Storage(_) => ErrorCode::Internal,
            GatewayError::Pool(PoolError::Disabled(_)) => ErrorCode::Validation,
            GatewayError::Pool(PoolError::NotConnected(_)) => ErrorCode::ServerDisconnected,
            GatewayError::Pool(_) => ErrorCode::UpstreamFailure,
        }
    }
}

/// The composition root: every kernel component constructed once, in
/// dependency order (database, migrations, registries, pool, router,
/// engine, webhook service), then shared by the HTTP layer and the
/// background subsystems. High-level server lifecycle operations live
/// here so registry, limiter, breaker, and pool state never drift apart.
pub struct Gateway {
    pub db: Db,
    pub events: Arc<EventBus>,
    pub registries: Arc<Registries>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<CircuitBreakers>,
    pub pool: ConnectionPool,
    pub router: Router,
    pub workflow_manager: Arc<WorkflowManager>,
    pub budget: Arc<BudgetEnforcer>,
    pub webhooks: WebhookService,
    pub semantic: Arc<SemanticIndex>,
    pub health_status: SharedHealthStatus,
    pub http_metrics: HttpMetrics,

    pub server_store: ServerStore,
    pub api_key_store: ApiKeyStore,
    pub workflow_store: WorkflowStore,
    pub execution_store: ExecutionStore,
    pub audit_store: AuditStore,
    pub usage_store: UsageStore,
}

impl Gateway {
    pub fn new(config: &Config, metrics: Metrics) -> anyhow::Result<(Self, WebhookWorker)> {
        if !config.data.exists() {
            std::fs::create_dir_all(&config.data)?;
        }
        let Metrics {
            http: http_metrics,
            gateway: subsystem_metrics,
        } = metrics;

        let db = Db::open(config.database_path())?;
        let applied = migrations::apply(&db)?;
        if applied > 0 {
            tracing::info!(applied, "database migrations applied");
        }

        let events = Arc::new(EventBus::new());
        let registries = Arc::new(Registries::new());
        let limiter = Arc::new(RateLimiter::new());
        let breakers = Arc::new(CircuitBreakers::new(
            BreakerConfig::default(),
            events.clone(),
        ));
        let pool = ConnectionPool::new(events.clone(), breakers.clone(), subsystem_metrics.pool);

        let server_store = ServerStore::new(db.clone());
        let api_key_store = ApiKeyStore::new(db.clone());
        let workflow_store = WorkflowStore::new(db.clone());
        let execution_store = ExecutionStore::new(db.clone());
        let audit_store = AuditStore::new(db.clone());
        let usage_store = UsageStore::new(db.clone());

        let router = Router::new(
            registries.clone(),
            breakers.clone(),
            limiter.clone(),
            pool.clone(),
            events.clone(),
            audit_store.clone(),
            usage_store.clone(),
            subsystem_metrics.router,
        );

        let embedder: Option<Arc<dyn Embedder>> =
            config.embeddings_api_key.as_ref().map(|key| {
                Arc::new(HttpEmbedder::new(
                    key.clone(),
                    config.embeddings_url.clone(),
                    config.embeddings_model.clone(),
                )) as Arc<dyn Embedder>
            });
        let semantic = Arc::new(SemanticIndex::new(
            embedder,
            EmbeddingStore::new(db.clone()),
        ));

        let budget = Arc::new(BudgetEnforcer::new(
            BudgetStore::new(db.clone()),
            workflow_store.clone(),
            events.clone(),
        ));

        let sampler: Arc<dyn SamplingProvider> = Arc::new(DisabledSampler);
        let step_host = Arc::new(GatewayStepHost::new(
            router.clone(),
            registries.clone(),
            pool.clone(),
            sampler,
        ));
        let engine = Arc::new(WorkflowEngine::new(
            EngineConfig {
                template_cache_size: config.template_cache_size,
            },
            step_host,
        ));

        let workflow_manager = Arc::new(WorkflowManager::new(
            engine,
            workflow_store.clone(),
            execution_store.clone(),
            budget.clone(),
            events.clone(),
            config.workflow_env.clone(),
            subsystem_metrics.workflow,
        ));

        let (webhooks, webhook_worker) =
            WebhookService::new(WebhookStore::new(db.clone()), subsystem_metrics.webhook);
        webhooks.attach(&events);

        let gateway = Self {
            db,
            events,
            registries,
            limiter,
            breakers,
            pool,
            router,
            workflow_manager,
            budget,
            webhooks,
            semantic,
            health_status: create_shared_health_status(),
            http_metrics,
            server_store,
            api_key_store,
            workflow_store,
            execution_store,
            audit_store,
            usage_store,
        };

        Ok((gateway, webhook_worker))
    }

    /// Brings a stored server online: transport up, catalog fetched,
    /// registries/limiter/breaker installed, semantic index refreshed.
    #[instrument(level = "debug", skip(self), fields(subsys = "Gateway"))]
    pub async fn connect_server(&self, id: &ServerId) -> Result<ConnectionStatus, GatewayError> {
        let server = self
            .server_store
            .get(id)?
            .ok_or_else(|| GatewayError::ServerNotFound(id.clone()))?;

        let status = self.pool.connect(&server).await?;

        let client = self
            .pool
            .client(id)
            .ok_or_else(|| PoolError::NotConnected(id.clone()))?;
        let catalog = match client.fetch_catalog().await {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!(%err, server = %id, "catalog fetch failed, registering empty");
                Default::default()
            }
        };

        self.registries.register_server(&server, &catalog);
        self.limiter.register(server.id.clone(), server.rate_limits);
        self.breakers.register(server.id.clone(), None);

        if self.semantic.enabled() {
            if let Err(err) = self.semantic.index_server(&self.registries, id).await {
                tracing::warn!(?err, server = %id, "semantic indexing failed");
            }
        }

        Ok(status)
    }

    #[instrument(level = "debug", skip(self), fields(subsys = "Gateway"))]
    pub async fn disconnect_server(&self, id: &ServerId) -> Result<(), GatewayError> {
        if self.server_store.get(id)?.is_none() {
            return Err(GatewayError::ServerNotFound(id.clone()));
        }
        self.pool.disconnect(id).await;
        Ok(())
    }

    /// Destroys a server: pool teardown, registry and embedding removal,
    /// admission state dropped, row deleted.
    #[instrument(level = "debug", skip(self), fields(subsys = "Gateway"))]
    pub async fn delete_server(&self, id: &ServerId) -> Result<bool, GatewayError> {
        self.pool.remove(id).await;

        // embeddings are keyed by entity id, which only the registries
        // still know at this point
        use toolgrid_types::EntityType;
        for tool in self.registries.tools.find_by_server(id) {
            self.semantic
                .remove_entity(EntityType::Tool, &tool.qualified_name);
        }
        for resource in self.registries.resources.find_by_server(id) {
            self.semantic
                .remove_entity(EntityType::Resource, &resource.uri);
        }
        for prompt in self.registries.prompts.find_by_server(id) {
            self.semantic
                .remove_entity(EntityType::Prompt, &prompt.qualified_name);
        }

        self.registries.unregister_server(id);
        self.limiter.unregister(id);
        self.breakers.remove(id);
        Ok(self.server_store.delete(id)?)
    }

    /// Reconnects every enabled server at boot; failures are logged, not
    /// fatal, so one bad upstream cannot hold the gateway down.
    pub async fn autoconnect(&self) {
        let servers = match self.server_store.list() {
            Ok(servers) => servers,
            Err(err) => {
                tracing::error!(?err, "autoconnect could not list servers");
                return;
            }
        };

        for server in servers.into_iter().filter(|s| s.enabled) {
            match self.connect_server(&server.id).await {
                Ok(status) => {
                    tracing::info!(server = %server.name, state = %status.state, "autoconnected")
                }
                Err(err) => tracing::warn!(server = %server.name, %err, "autoconnect failed"),
            }
        }
    }
}
