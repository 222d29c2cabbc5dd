/// Application context and dependency injection
use crate::{
    auth::{AuthGate, PresentationVerifier, ScopePolicy, StaticKeyResolver, TrustedIssuerRegistry},
    cache::MappingCache,
    config::{ServerConfig, StoreBackendKind},
    db,
    engine::ResolutionEngine,
    error::BdrsResult,
    jobs::JobHeartbeats,
    store::{InMemoryMappingStore, SqliteMappingStore, StoreBackend},
};
use std::{sync::Arc, time::Instant};
use tracing::{info, warn};

/// Engine over the backend chosen at startup
pub type Engine = ResolutionEngine<StoreBackend>;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub engine: Arc<Engine>,
    pub auth: Arc<AuthGate>,
    pub jobs: Arc<JobHeartbeats>,
    pub started_at: Instant,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> BdrsResult<Self> {
        // Validate configuration
        config.validate()?;

        let store = Self::open_store(&config).await?;
        info!("Mapping store backend: {}", store.kind());

        let cache = Arc::new(MappingCache::new(config.cache_config()));
        if cache.is_enabled() {
            info!(
                capacity = config.cache.capacity,
                shards = config.cache.shards,
                ttl_secs = config.cache.ttl_secs,
                "Resolution cache enabled"
            );
        } else {
            info!("Resolution cache disabled");
        }

        let engine = Arc::new(ResolutionEngine::new(store, cache, config.engine_config()));
        let auth = Arc::new(Self::build_auth_gate(&config)?);

        Ok(Self::from_parts(config, engine, auth))
    }

    /// Assemble a context from already built services
    pub fn from_parts(config: ServerConfig, engine: Arc<Engine>, auth: Arc<AuthGate>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            auth,
            jobs: Arc::new(JobHeartbeats::new()),
            started_at: Instant::now(),
        }
    }

    async fn open_store(config: &ServerConfig) -> BdrsResult<StoreBackend> {
        match config.storage.backend {
            StoreBackendKind::Memory => {
                warn!("In-memory store selected; mappings are lost on restart");
                Ok(StoreBackend::Memory(InMemoryMappingStore::new()))
            }
            StoreBackendKind::Sqlite => {
                let pool = db::create_pool(
                    &config.storage.database_path,
                    db::DatabaseOptions {
                        max_connections: config.storage.max_connections,
                        ..db::DatabaseOptions::default()
                    },
                )
                .await?;

                if config.storage.migrations_enabled {
                    db::run_migrations(&pool).await?;
                } else {
                    info!("Schema migrations disabled");
                }

                // Test connection
                db::test_connection(&pool).await?;

                Ok(StoreBackend::Sqlite(SqliteMappingStore::new(pool)))
            }
        }
    }

    fn build_auth_gate(config: &ServerConfig) -> BdrsResult<AuthGate> {
        let auth = &config.authentication;

        let keys = match &auth.did_keys_file {
            Some(path) => StaticKeyResolver::from_file(path)?,
            None => {
                warn!("No BDRS_DID_KEYS_FILE configured; presentations cannot be verified");
                StaticKeyResolver::new()
            }
        };
        info!(
            keys = keys.len(),
            trusted_issuers = auth.trusted_issuers.len(),
            "Credential verification configured"
        );

        let verifier = PresentationVerifier::new(
            Arc::new(keys),
            TrustedIssuerRegistry::new(auth.trusted_issuers.iter().cloned()),
            auth.expected_audience.clone(),
            auth.membership_credential_type.clone(),
        );

        let policy = ScopePolicy {
            management_principals: auth.management_principals.iter().cloned().collect(),
            management_credential_type: auth.management_credential_type.clone(),
        };

        Ok(AuthGate::new(
            Arc::new(verifier),
            policy,
            auth.management_api_key.clone(),
        ))
    }

    /// Get service DID
    pub fn service_did(&self) -> &str {
        &self.config.service.service_did
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}
