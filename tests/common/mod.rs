//! Configuration and tokens shared by the router-level tests.

#![allow(dead_code)]

use waypoint::config::{
    AuthConfig, CacheConfig, Config, DatabaseConfig, RoutingConfig, ServerConfig, SolverConfig,
    TrackingConfig, TransitionConfig,
};
use waypoint::middleware::auth::JwtVerifier;
use waypoint::models::position::{Identity, Role};

pub const SECRET: &str = "test-secret";

/// In-memory backends, unreachable upstreams.
pub fn config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            log_json: false,
        },
        database: DatabaseConfig {
            url: None,
            max_connections: 1,
            min_connections: 0,
            acquire_timeout_secs: 1,
        },
        cache: CacheConfig {
            redis_url: None,
            ttl_secs: 60,
        },
        routing: RoutingConfig {
            osrm_url: "http://127.0.0.1:1".into(),
            profile: "driving".into(),
            timeout_secs: 1,
            max_matrix_coordinates: 10,
        },
        solver: SolverConfig {
            vroom_url: None,
            hosted_url: "http://127.0.0.1:1".into(),
            hosted_project: None,
            hosted_token: None,
            timeout_secs: 1,
        },
        tracking: TrackingConfig {
            freshness_secs: 300,
            outbound_buffer: 16,
        },
        transitions: TransitionConfig {
            interval_secs: 300,
            utc_offset_minutes: 0,
        },
        auth: AuthConfig {
            jwt_secret: SECRET.into(),
        },
    }
}

pub fn token(agent_id: &str, role: Role) -> String {
    JwtVerifier::new(SECRET)
        .issue(
            &Identity {
                agent_id: agent_id.into(),
                role,
            },
            chrono::Duration::minutes(5),
        )
        .unwrap()
}
