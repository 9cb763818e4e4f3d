pub mod database;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
    pub solver: SolverConfig,
    pub tracking: TrackingConfig,
    pub transitions: TransitionConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    pub osrm_url: String,
    pub profile: String,
    pub timeout_secs: u64,
    pub max_matrix_coordinates: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    pub vroom_url: Option<String>,
    pub hosted_url: String,
    pub hosted_project: Option<String>,
    pub hosted_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    pub freshness_secs: u64,
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionConfig {
    pub interval_secs: u64,
    /// Offset of the reference timezone used to decide what "today" is.
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl Config {
    /// Reads `WAYPOINT__<SECTION>__<KEY>` variables on top of the defaults.
    ///
    /// `WAYPOINT__AUTH__JWT_SECRET` has no default. Malformed values are
    /// returned as errors.
    pub fn from_env() -> anyhow::Result<Self> {
        let settings = Self::defaults()?
            .add_source(
                config::Environment::with_prefix("WAYPOINT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> anyhow::Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.log_json", false)?
            .set_default("database.max_connections", 25)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("cache.ttl_secs", 900)?
            .set_default("routing.osrm_url", "http://localhost:5000")?
            .set_default("routing.profile", "driving")?
            .set_default("routing.timeout_secs", 15)?
            .set_default("routing.max_matrix_coordinates", 100)?
            .set_default("solver.hosted_url", "https://routeoptimization.googleapis.com")?
            .set_default("solver.timeout_secs", 60)?
            .set_default("tracking.freshness_secs", 300)?
            .set_default("tracking.outbound_buffer", 256)?
            .set_default("transitions.interval_secs", 300)?
            .set_default("transitions.utc_offset_minutes", 60)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        if self.routing.max_matrix_coordinates < 2 {
            anyhow::bail!("routing.max_matrix_coordinates must be at least 2");
        }
        if self.transitions.utc_offset_minutes.abs() > 14 * 60 {
            anyhow::bail!(
                "transitions.utc_offset_minutes out of range: {}",
                self.transitions.utc_offset_minutes
            );
        }
        if self.tracking.outbound_buffer == 0 {
            anyhow::bail!("tracking.outbound_buffer must be positive");
        }
        Ok(())
    }
}
