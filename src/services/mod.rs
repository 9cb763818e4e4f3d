pub mod broadcast;
pub mod cache;
pub mod hub;
pub mod position_store;
pub mod positions;
pub mod route_client;
pub mod transitions;
pub mod trip_optimizer;
pub(crate) mod upstream;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{database, Config};
use crate::logger::redact;
use crate::middleware::auth::{IdentityVerifier, JwtVerifier};
use crate::repository::{
    AgentDirectory, MemoryAgentDirectory, MemoryPreparationRepository, NoopPositionHistory,
    PgAgentDirectory, PgPositionHistory, PgPreparationRepository, PositionHistory,
    PreparationRepository,
};
use broadcast::ChannelRegistry;
use cache::{CacheAside, MemoryCache, RedisCache};
use hub::Hub;
use position_store::{MemoryPositionStore, PositionStore, RedisPositionStore};
use positions::PositionService;
use route_client::RouteClient;
use transitions::{TransitionEngine, TransitionScheduler};
use trip_optimizer::{select_backend, SolverBackend, TripOptimizer};

/// Storage and upstream collaborators the services are built on.
pub struct Backends {
    pub cache: CacheAside,
    pub position_store: Arc<dyn PositionStore>,
    pub directory: Arc<dyn AgentDirectory>,
    pub history: Arc<dyn PositionHistory>,
    pub preparations: Arc<dyn PreparationRepository>,
    pub solver: Option<Arc<dyn SolverBackend>>,
}

impl Backends {
    /// Everything in process. The solver is still chosen from configuration.
    pub fn in_memory(config: &Config) -> Self {
        Self {
            cache: CacheAside::new(Arc::new(MemoryCache::new())),
            position_store: Arc::new(MemoryPositionStore::new()),
            directory: Arc::new(MemoryAgentDirectory::default()),
            history: Arc::new(NoopPositionHistory),
            preparations: Arc::new(MemoryPreparationRepository::new()),
            solver: select_backend(&config.solver),
        }
    }

    /// Postgres and Redis where configured, in-memory stand-ins otherwise.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let mut backends = Self::in_memory(config);

        if let Some(url) = config.database.url.as_deref() {
            let pool = database::create_pool(&config.database, url).await?;
            database::run_migrations(&pool).await?;
            backends.directory = Arc::new(PgAgentDirectory::new(pool.clone()));
            backends.history = Arc::new(PgPositionHistory::new(pool.clone()));
            backends.preparations = Arc::new(PgPreparationRepository::new(pool));
            tracing::info!("using postgres persistence");
        } else {
            tracing::warn!("no database configured, preparations and agents are kept in memory");
        }

        if let Some(url) = config.cache.redis_url.as_deref() {
            let redis = RedisCache::new(url)?;
            backends.position_store = Arc::new(RedisPositionStore::new(redis.pool()));
            backends.cache = CacheAside::new(Arc::new(redis));
            tracing::info!("using redis cache and position store");
        }

        match (&backends.solver, &config.solver.hosted_token) {
            (Some(solver), Some(token)) if solver.name() != "vroom" => {
                tracing::info!(backend = solver.name(), token = %redact(token), "trip solver selected");
            }
            (Some(solver), _) => tracing::info!(backend = solver.name(), "trip solver selected"),
            (None, _) => tracing::warn!("no trip solver configured, trip optimization disabled"),
        }
        Ok(backends)
    }
}

pub struct AppState {
    pub config: Config,
    pub routes: Arc<RouteClient>,
    pub trips: Arc<TripOptimizer>,
    pub positions: PositionService,
    pub hub: Arc<Hub>,
    pub transitions: TransitionScheduler,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let backends = Backends::connect(&config).await?;
        Self::assemble(config, backends)
    }

    pub fn assemble(config: Config, backends: Backends) -> anyhow::Result<Self> {
        let ttl = Duration::from_secs(config.cache.ttl_secs);
        let routes = Arc::new(RouteClient::new(&config.routing, backends.cache.clone(), ttl));
        let trips = Arc::new(TripOptimizer::new(backends.solver, backends.cache, ttl));

        let registry = Arc::new(ChannelRegistry::new());
        let positions = PositionService::new(
            backends.position_store,
            backends.directory,
            backends.history,
            registry.clone(),
            Duration::from_secs(config.tracking.freshness_secs),
        );
        let hub = Arc::new(Hub::new(
            registry,
            positions.clone(),
            config.tracking.outbound_buffer,
        ));

        let engine = TransitionEngine::new(backends.preparations, config.transitions.utc_offset_minutes)?;
        let transitions = TransitionScheduler::new(engine);
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(&config.auth.jwt_secret));

        Ok(Self {
            config,
            routes,
            trips,
            positions,
            hub,
            transitions,
            verifier,
            shutdown: CancellationToken::new(),
        })
    }
}
