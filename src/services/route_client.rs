//! Client for an OSRM-compatible routing engine.
//!
//! Public calls fail closed: they log the classified failure and return
//! `None`. The `try_*` variants expose the typed [`RoutingError`].

use serde::Deserialize;
use std::time::Duration;

use super::cache::CacheAside;
use super::upstream::{self, build_client, decode, execute};
use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::models::geo::Coordinate;
use crate::models::routing::{DistanceMatrix, OrderedRoute, RouteLeg, RouteSummary};
use crate::utils::Fingerprint;

const UPSTREAM: &str = "osrm";

#[derive(Clone, Debug)]
pub struct RouteOptions {
    /// Ask for the full encoded polyline.
    pub geometry: bool,
    pub use_cache: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            geometry: true,
            use_cache: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripEndpoint {
    Any,
    First,
    Last,
}

impl TripEndpoint {
    fn as_str(&self) -> &'static str {
        match self {
            TripEndpoint::Any => "any",
            TripEndpoint::First => "first",
            TripEndpoint::Last => "last",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TripOptions {
    pub roundtrip: bool,
    pub source: TripEndpoint,
    pub destination: TripEndpoint,
    pub use_cache: bool,
}

impl Default for TripOptions {
    fn default() -> Self {
        Self {
            roundtrip: true,
            source: TripEndpoint::First,
            destination: TripEndpoint::Any,
            use_cache: true,
        }
    }
}

#[derive(Deserialize)]
struct OsrmStatus {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    #[serde(default)]
    geometry: Option<String>,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Deserialize)]
struct OsrmLeg {
    distance: f64,
    duration: f64,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct OsrmRouteResponse {
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Deserialize)]
struct OsrmTableResponse {
    #[serde(default)]
    durations: Option<Vec<Vec<Option<f64>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f64>>>>,
}

#[derive(Deserialize)]
struct OsrmWaypoint {
    waypoint_index: usize,
    #[serde(default)]
    trips_index: usize,
}

#[derive(Deserialize)]
struct OsrmTripResponse {
    #[serde(default)]
    trips: Vec<OsrmRoute>,
    #[serde(default)]
    waypoints: Vec<OsrmWaypoint>,
}

pub struct RouteClient {
    http: reqwest::Client,
    base_url: String,
    profile: String,
    cache: CacheAside,
    ttl: Duration,
    max_matrix_coordinates: usize,
}

impl RouteClient {
    pub fn new(config: &RoutingConfig, cache: CacheAside, ttl: Duration) -> Self {
        Self {
            http: build_client(Duration::from_secs(config.timeout_secs)),
            base_url: config.osrm_url.trim_end_matches('/').to_string(),
            profile: config.profile.clone(),
            cache,
            ttl,
            max_matrix_coordinates: config.max_matrix_coordinates,
        }
    }

    pub async fn route(&self, coords: &[Coordinate], opts: &RouteOptions) -> Option<RouteSummary> {
        self.try_route(coords, opts)
            .await
            .map_err(|e| log_failure("route", coords.len(), &e))
            .ok()
    }

    pub async fn matrix(&self, coords: &[Coordinate], use_cache: bool) -> Option<DistanceMatrix> {
        self.try_matrix(coords, use_cache)
            .await
            .map_err(|e| log_failure("matrix", coords.len(), &e))
            .ok()
    }

    pub async fn optimize_route(
        &self,
        coords: &[Coordinate],
        opts: &TripOptions,
    ) -> Option<OrderedRoute> {
        self.try_optimize_route(coords, opts)
            .await
            .map_err(|e| log_failure("optimize_route", coords.len(), &e))
            .ok()
    }

    pub async fn try_route(
        &self,
        coords: &[Coordinate],
        opts: &RouteOptions,
    ) -> Result<RouteSummary, RoutingError> {
        validate(coords, 2)?;
        let mut key = Fingerprint::new("route");
        key.coordinates(coords)
            .field("profile", &self.profile)
            .field("geometry", opts.geometry);
        let key = key.finish();

        let fetch = || async {
            let url = format!(
                "{}/route/v1/{}/{}",
                self.base_url,
                self.profile,
                coordinate_path(coords)
            );
            let overview = if opts.geometry { "full" } else { "false" };
            let request = self.http.get(&url).query(&[
                ("overview", overview),
                ("geometries", "polyline"),
                ("steps", "false"),
            ]);
            let body = self.fetch(request).await?;
            let response: OsrmRouteResponse = decode(&body, UPSTREAM)?;
            let route = response.routes.into_iter().next().ok_or_else(|| {
                RoutingError::NoSolution("osrm returned no route".to_string())
            })?;

            Ok::<_, RoutingError>(RouteSummary {
                distance: route.distance,
                duration: route.duration,
                geometry: route.geometry,
                legs: route
                    .legs
                    .into_iter()
                    .map(|leg| RouteLeg {
                        distance: leg.distance,
                        duration: leg.duration,
                        summary: leg.summary,
                    })
                    .collect(),
            })
        };

        if opts.use_cache {
            self.cache.get_or_compute(&key, self.ttl, fetch).await
        } else {
            fetch().await
        }
    }

    pub async fn try_matrix(
        &self,
        coords: &[Coordinate],
        use_cache: bool,
    ) -> Result<DistanceMatrix, RoutingError> {
        validate(coords, 2)?;
        if coords.len() > self.max_matrix_coordinates {
            return Err(RoutingError::MalformedInput(format!(
                "matrix limited to {} coordinates, got {}",
                self.max_matrix_coordinates,
                coords.len()
            )));
        }
        let mut key = Fingerprint::new("matrix");
        key.coordinates(coords).field("profile", &self.profile);
        let key = key.finish();

        let n = coords.len();
        let fetch = || async {
            let url = format!(
                "{}/table/v1/{}/{}",
                self.base_url,
                self.profile,
                coordinate_path(coords)
            );
            let request = self
                .http
                .get(&url)
                .query(&[("annotations", "duration,distance")]);
            let body = self.fetch(request).await?;
            let response: OsrmTableResponse = decode(&body, UPSTREAM)?;

            let durations = response.durations.ok_or_else(|| {
                RoutingError::InvalidResponse("osrm table without durations".to_string())
            })?;
            let distances = response.distances.ok_or_else(|| {
                RoutingError::InvalidResponse("osrm table without distances".to_string())
            })?;
            if !is_square(&durations, n) || !is_square(&distances, n) {
                return Err(RoutingError::InvalidResponse(format!(
                    "osrm table is not {}x{}",
                    n, n
                )));
            }
            Ok::<_, RoutingError>(DistanceMatrix {
                distances,
                durations,
            })
        };

        if use_cache {
            self.cache.get_or_compute(&key, self.ttl, fetch).await
        } else {
            fetch().await
        }
    }

    pub async fn try_optimize_route(
        &self,
        coords: &[Coordinate],
        opts: &TripOptions,
    ) -> Result<OrderedRoute, RoutingError> {
        validate(coords, 2)?;
        if !opts.roundtrip
            && (opts.source != TripEndpoint::First || opts.destination != TripEndpoint::Last)
        {
            return Err(RoutingError::MalformedInput(
                "open trips need source=first and destination=last".to_string(),
            ));
        }
        if opts.source == TripEndpoint::Last || opts.destination == TripEndpoint::First {
            return Err(RoutingError::MalformedInput(format!(
                "unsupported trip endpoints source={} destination={}",
                opts.source.as_str(),
                opts.destination.as_str()
            )));
        }
        let mut key = Fingerprint::new("osrm-trip");
        key.coordinates(coords)
            .field("profile", &self.profile)
            .field("roundtrip", opts.roundtrip)
            .field("source", opts.source.as_str())
            .field("destination", opts.destination.as_str());
        let key = key.finish();

        let n = coords.len();
        let fetch = || async {
            let url = format!(
                "{}/trip/v1/{}/{}",
                self.base_url,
                self.profile,
                coordinate_path(coords)
            );
            let request = self.http.get(&url).query(&[
                ("roundtrip", if opts.roundtrip { "true" } else { "false" }),
                ("source", opts.source.as_str()),
                ("destination", opts.destination.as_str()),
                ("overview", "full"),
                ("geometries", "polyline"),
            ]);
            let body = self.fetch(request).await?;
            let response: OsrmTripResponse = decode(&body, UPSTREAM)?;
            into_ordered_route(response, n)
        };

        if opts.use_cache {
            self.cache.get_or_compute(&key, self.ttl, fetch).await
        } else {
            fetch().await
        }
    }

    /// Performs the request and checks both the HTTP status and OSRM's
    /// own `code` field.
    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<String, RoutingError> {
        let response = execute(request, UPSTREAM).await?;
        let status: Option<OsrmStatus> = serde_json::from_str(&response.body).ok();

        match status {
            Some(s) if s.code == "Ok" && response.status.is_success() => Ok(response.body),
            Some(s) if matches!(s.code.as_str(), "NoRoute" | "NoTrips" | "NoSegment" | "NoTable") => {
                Err(RoutingError::NoSolution(format!(
                    "osrm {}: {}",
                    s.code,
                    s.message.unwrap_or_default()
                )))
            }
            Some(s) => Err(RoutingError::Rejected {
                status: response.status.as_u16(),
                message: format!("{}: {}", s.code, s.message.unwrap_or_default()),
            }),
            None if !response.status.is_success() => Err(RoutingError::Rejected {
                status: response.status.as_u16(),
                message: upstream::snippet(&response.body),
            }),
            None => Err(RoutingError::InvalidResponse(format!(
                "osrm body without code: {}",
                upstream::snippet(&response.body)
            ))),
        }
    }
}

fn validate(coords: &[Coordinate], min: usize) -> Result<(), RoutingError> {
    if coords.len() < min {
        return Err(RoutingError::InsufficientInput(format!(
            "need at least {} coordinates, got {}",
            min,
            coords.len()
        )));
    }
    if let Some((i, c)) = coords.iter().enumerate().find(|(_, c)| !c.is_valid()) {
        return Err(RoutingError::MalformedInput(format!(
            "coordinate {} out of range: {}, {}",
            i, c.latitude, c.longitude
        )));
    }
    Ok(())
}

/// `lon,lat;lon,lat` as OSRM expects.
fn coordinate_path(coords: &[Coordinate]) -> String {
    coords
        .iter()
        .map(|c| {
            let [lon, lat] = c.lon_lat();
            format!("{:.6},{:.6}", lon, lat)
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn is_square(matrix: &[Vec<Option<f64>>], n: usize) -> bool {
    matrix.len() == n && matrix.iter().all(|row| row.len() == n)
}

fn into_ordered_route(response: OsrmTripResponse, n: usize) -> Result<OrderedRoute, RoutingError> {
    let trip = response
        .trips
        .into_iter()
        .next()
        .ok_or_else(|| RoutingError::NoSolution("osrm returned no trip".to_string()))?;
    if response.waypoints.len() != n {
        return Err(RoutingError::InvalidResponse(format!(
            "osrm trip has {} waypoints for {} coordinates",
            response.waypoints.len(),
            n
        )));
    }
    if response.waypoints.iter().any(|w| w.trips_index != 0) {
        return Err(RoutingError::NoSolution(
            "coordinates split across several trips".to_string(),
        ));
    }

    let mut order = vec![usize::MAX; n];
    for (input_index, waypoint) in response.waypoints.iter().enumerate() {
        let slot = order.get_mut(waypoint.waypoint_index).ok_or_else(|| {
            RoutingError::InvalidResponse(format!(
                "waypoint_index {} out of range",
                waypoint.waypoint_index
            ))
        })?;
        *slot = input_index;
    }
    if order.contains(&usize::MAX) {
        return Err(RoutingError::InvalidResponse(
            "osrm trip waypoint indices are not a permutation".to_string(),
        ));
    }

    Ok(OrderedRoute {
        order,
        distance: trip.distance,
        duration: trip.duration,
        geometry: trip.geometry,
    })
}

fn log_failure(operation: &'static str, coordinates: usize, error: &RoutingError) {
    if error.is_local() {
        tracing::warn!(
            operation,
            coordinates,
            kind = error.kind(),
            error = %error,
            "routing request refused locally"
        );
    } else {
        tracing::error!(
            operation,
            coordinates,
            kind = error.kind(),
            error = %error,
            "routing upstream call failed"
        );
    }
}
