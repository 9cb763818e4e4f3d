//! Route client against a stubbed OSRM upstream.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use waypoint::config::RoutingConfig;
use waypoint::error::RoutingError;
use waypoint::models::geo::Coordinate;
use waypoint::services::cache::{CacheAside, MemoryCache};
use waypoint::services::route_client::{RouteClient, RouteOptions, TripOptions};

fn client(server: &MockServer, cache: CacheAside) -> RouteClient {
    let config = RoutingConfig {
        osrm_url: server.uri(),
        profile: "driving".to_string(),
        timeout_secs: 5,
        max_matrix_coordinates: 3,
    };
    RouteClient::new(&config, cache, Duration::from_secs(900))
}

fn coords() -> Vec<Coordinate> {
    vec![Coordinate::new(48.85, 2.35), Coordinate::new(48.90, 2.40)]
}

#[tokio::test]
async fn test_route_uses_longitude_first_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/route/v1/driving/2.350000,48.850000;2.400000,48.900000"))
        .and(query_param("overview", "full"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "Ok",
            "routes": [{
                "distance": 7300.5,
                "duration": 840.2,
                "geometry": "_p~iF~ps|U",
                "legs": [{"distance": 7300.5, "duration": 840.2, "summary": "Rue de Rivoli"}]
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let summary = client(&server, CacheAside::disabled())
        .route(&coords(), &RouteOptions::default())
        .await
        .expect("route must be returned");

    assert_eq!(summary.distance, 7300.5);
    assert_eq!(summary.legs.len(), 1);
    assert_eq!(summary.geometry.as_deref(), Some("_p~iF~ps|U"));
}

#[tokio::test]
async fn test_route_cached_after_first_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/route/v1/driving/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "Ok",
            "routes": [{"distance": 10.0, "duration": 2.0, "legs": []}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let routes = client(&server, CacheAside::new(Arc::new(MemoryCache::new())));

    let first = routes.route(&coords(), &RouteOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Jitter below the fingerprint precision hits the same entry.
    let nudged = vec![Coordinate::new(48.850_000_1, 2.35), Coordinate::new(48.90, 2.40)];
    let second = routes.route(&nudged, &RouteOptions::default()).await;

    assert!(first.is_some());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_no_route_is_classified_and_public_call_returns_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "NoRoute",
            "message": "Impossible route between points"
        })))
        .mount(&server)
        .await;
    let routes = client(&server, CacheAside::disabled());

    let typed = routes.try_route(&coords(), &RouteOptions::default()).await;
    assert!(matches!(typed, Err(RoutingError::NoSolution(_))));

    assert!(routes.route(&coords(), &RouteOptions::default()).await.is_none());
}

#[tokio::test]
async fn test_upstream_rejection_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "InvalidQuery",
            "message": "Query string malformed"
        })))
        .mount(&server)
        .await;

    let result = client(&server, CacheAside::disabled())
        .try_route(&coords(), &RouteOptions::default())
        .await;

    assert!(matches!(result, Err(RoutingError::Rejected { status: 400, .. })));
}

#[tokio::test]
async fn test_matrix_returns_square_tables() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/table/v1/driving/"))
        .and(query_param("annotations", "duration,distance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "Ok",
            "durations": [[0.0, 600.0], [620.0, 0.0]],
            "distances": [[0.0, 7000.0], [null, 0.0]]
        })))
        .mount(&server)
        .await;

    let matrix = client(&server, CacheAside::disabled())
        .matrix(&coords(), false)
        .await
        .expect("matrix must be returned");

    assert_eq!(matrix.durations[1][0], Some(620.0));
    assert_eq!(matrix.distances[1][0], None);
}

#[tokio::test]
async fn test_matrix_limit_fails_without_network_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let many: Vec<Coordinate> = (0..4).map(|i| Coordinate::new(48.0 + i as f64 * 0.1, 2.0)).collect();

    let result = client(&server, CacheAside::disabled())
        .try_matrix(&many, false)
        .await;

    assert!(matches!(result, Err(RoutingError::MalformedInput(_))));
}

#[tokio::test]
async fn test_optimize_route_returns_visit_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/trip/v1/driving/"))
        .and(query_param("roundtrip", "true"))
        .and(query_param("source", "first"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "Ok",
            "trips": [{"distance": 15000.0, "duration": 1800.0, "legs": []}],
            "waypoints": [
                {"waypoint_index": 0, "trips_index": 0},
                {"waypoint_index": 2, "trips_index": 0},
                {"waypoint_index": 1, "trips_index": 0}
            ]
        })))
        .mount(&server)
        .await;
    let three = vec![
        Coordinate::new(48.85, 2.35),
        Coordinate::new(48.90, 2.40),
        Coordinate::new(48.87, 2.30),
    ];

    let ordered = client(&server, CacheAside::disabled())
        .optimize_route(&three, &TripOptions::default())
        .await
        .expect("ordered route must be returned");

    assert_eq!(ordered.order, vec![0, 2, 1]);
    assert_eq!(ordered.duration, 1800.0);
}
