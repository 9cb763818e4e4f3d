//! Cloud route-optimization API backend (`optimizeTours`).
//!
//! The API speaks in absolute timestamps. Seconds since local midnight are
//! encoded as timestamps on 1970-01-01 UTC and decoded the same way, so no
//! timezone conversion happens on either side.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{SolverBackend, SolverHealth};
use crate::error::RoutingError;
use crate::models::routing::{RoutingProblem, RoutingSolution, SolutionTotals, Visit};
use crate::services::upstream::{build_client, decode, execute, snippet};

const UPSTREAM: &str = "hosted-optimization";

/// Cost of skipping a stop. Priority raises it so that low-priority stops
/// are dropped first when the day is over-booked.
const BASE_PENALTY: f64 = 10_000.0;
const PRIORITY_PENALTY_STEP: f64 = 1_000.0;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeToursRequest {
    model: ShipmentModel,
    populate_polylines: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShipmentModel {
    global_start_time: String,
    global_end_time: String,
    shipments: Vec<Shipment>,
    vehicles: Vec<Vehicle>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Shipment {
    label: String,
    deliveries: Vec<VisitRequest>,
    penalty_cost: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitRequest {
    arrival_location: LatLng,
    duration: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    time_windows: Vec<TimeWindowRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeWindowRequest {
    start_time: String,
    end_time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Vehicle {
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_location: Option<LatLng>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_location: Option<LatLng>,
    start_time_windows: Vec<StartWindow>,
    end_time_windows: Vec<EndWindow>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartWindow {
    start_time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndWindow {
    end_time: String,
}

#[derive(Serialize)]
struct LatLng {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct OptimizeToursResponse {
    #[serde(default)]
    routes: Vec<ShipmentRoute>,
    #[serde(default)]
    skipped_shipments: Vec<SkippedShipment>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ShipmentRoute {
    #[serde(default)]
    visits: Vec<RouteVisit>,
    #[serde(default)]
    transitions: Vec<Transition>,
    #[serde(default)]
    metrics: Option<RouteMetrics>,
    #[serde(default)]
    route_polyline: Option<Polyline>,
}

/// Proto3 JSON omits zero values, so indices are optional.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteVisit {
    #[serde(default)]
    shipment_index: Option<usize>,
    start_time: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transition {
    #[serde(default)]
    wait_duration: Option<String>,
    #[serde(default)]
    travel_distance_meters: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteMetrics {
    #[serde(default)]
    travel_distance_meters: Option<f64>,
    #[serde(default)]
    total_duration: Option<String>,
    #[serde(default)]
    wait_duration: Option<String>,
    #[serde(default)]
    visit_duration: Option<String>,
}

#[derive(Deserialize)]
struct Polyline {
    points: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkippedShipment {
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

pub struct HostedOptimizationBackend {
    http: reqwest::Client,
    base_url: String,
    project: Option<String>,
    token: Option<String>,
}

impl HostedOptimizationBackend {
    pub fn new(
        base_url: &str,
        project: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.filter(|p| !p.is_empty()),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.project.as_deref()?, self.token.as_deref()?))
    }

    fn request_body(problem: &RoutingProblem) -> OptimizeToursRequest {
        let window = problem.vehicle_window;
        let shipments = problem
            .stops
            .iter()
            .map(|stop| Shipment {
                label: stop.id.to_string(),
                deliveries: vec![VisitRequest {
                    arrival_location: LatLng {
                        latitude: stop.location.latitude,
                        longitude: stop.location.longitude,
                    },
                    duration: format!("{}s", stop.service_secs),
                    time_windows: stop
                        .time_window
                        .map(|w| {
                            vec![TimeWindowRequest {
                                start_time: encode_time(w.start),
                                end_time: encode_time(w.end),
                            }]
                        })
                        .unwrap_or_default(),
                }],
                penalty_cost: BASE_PENALTY
                    + f64::from(stop.priority.unwrap_or(0)) * PRIORITY_PENALTY_STEP,
            })
            .collect();

        let to_lat_lng = |c: crate::models::geo::Coordinate| LatLng {
            latitude: c.latitude,
            longitude: c.longitude,
        };

        OptimizeToursRequest {
            model: ShipmentModel {
                global_start_time: encode_time(window.start),
                global_end_time: encode_time(window.end),
                shipments,
                vehicles: vec![Vehicle {
                    label: "vehicle-1".to_string(),
                    start_location: problem.start.map(to_lat_lng),
                    end_location: problem.end.map(to_lat_lng),
                    start_time_windows: vec![StartWindow {
                        start_time: encode_time(window.start),
                    }],
                    end_time_windows: vec![EndWindow {
                        end_time: encode_time(window.end),
                    }],
                }],
            },
            populate_polylines: true,
        }
    }
}

#[async_trait]
impl SolverBackend for HostedOptimizationBackend {
    fn name(&self) -> &'static str {
        UPSTREAM
    }

    async fn solve(&self, problem: &RoutingProblem) -> Result<RoutingSolution, RoutingError> {
        let (project, token) = self.credentials().ok_or_else(|| {
            RoutingError::Unreachable("hosted optimization credentials not configured".to_string())
        })?;
        let url = format!("{}/v1/projects/{}:optimizeTours", self.base_url, project);
        let request = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&Self::request_body(problem));

        let response = execute(request, UPSTREAM).await?;
        if !response.status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&response.body)
                .map(|b| format!("{}: {}", b.error.status, b.error.message))
                .unwrap_or_else(|_| snippet(&response.body));
            return Err(RoutingError::Rejected {
                status: response.status.as_u16(),
                message,
            });
        }
        let parsed: OptimizeToursResponse = decode(&response.body, UPSTREAM)?;
        into_solution(parsed, problem)
    }

    async fn health(&self) -> SolverHealth {
        let (available, description) = match (&self.project, &self.token) {
            (Some(project), Some(_)) => (
                true,
                format!("hosted optimization configured for project {}", project),
            ),
            (None, _) => (false, "hosted optimization project not configured".to_string()),
            (_, None) => (false, "hosted optimization credential not configured".to_string()),
        };
        SolverHealth {
            backend: UPSTREAM.to_string(),
            available,
            description,
        }
    }
}

fn encode_time(secs: u32) -> String {
    DateTime::<Utc>::from_timestamp(i64::from(secs), 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn decode_time(value: &str) -> Result<u32, RoutingError> {
    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| {
        RoutingError::InvalidResponse(format!("bad timestamp {:?}: {}", value, e))
    })?;
    u32::try_from(parsed.timestamp())
        .map_err(|_| RoutingError::InvalidResponse(format!("timestamp {} outside day", value)))
}

/// Parses proto durations such as `"600s"` or `"12.5s"`.
fn decode_duration(value: Option<&str>) -> Result<u32, RoutingError> {
    let Some(value) = value else {
        return Ok(0);
    };
    value
        .strip_suffix('s')
        .and_then(|n| n.parse::<f64>().ok())
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.round() as u32)
        .ok_or_else(|| RoutingError::InvalidResponse(format!("bad duration {:?}", value)))
}

fn into_solution(
    response: OptimizeToursResponse,
    problem: &RoutingProblem,
) -> Result<RoutingSolution, RoutingError> {
    let route = response.routes.into_iter().next().unwrap_or_default();

    let mut visits = Vec::with_capacity(route.visits.len());
    for (i, visit) in route.visits.iter().enumerate() {
        let index = visit.shipment_index.unwrap_or(0);
        let stop = problem.stops.get(index).ok_or_else(|| {
            RoutingError::InvalidResponse(format!("shipment index {} out of range", index))
        })?;
        let transition = route.transitions.get(i);
        let waiting_time = decode_duration(transition.and_then(|t| t.wait_duration.as_deref()))?;
        let service_start = decode_time(&visit.start_time)?;
        visits.push(Visit {
            stop_id: stop.id,
            arrival: service_start.saturating_sub(waiting_time),
            waiting_time,
            service_time: stop.service_secs,
            distance: transition.and_then(|t| t.travel_distance_meters),
        });
    }

    if visits.is_empty() {
        return Err(RoutingError::NoSolution(format!(
            "hosted optimization skipped all {} stops",
            problem.stops.len()
        )));
    }

    let mut unassigned = Vec::new();
    for skipped in &response.skipped_shipments {
        let index = skipped.index.unwrap_or(0);
        let stop = problem.stops.get(index).ok_or_else(|| {
            RoutingError::InvalidResponse(format!("skipped shipment {} out of range", index))
        })?;
        unassigned.push(stop.id);
    }

    let totals = match &route.metrics {
        Some(m) => SolutionTotals {
            distance: m.travel_distance_meters.unwrap_or_default(),
            duration: decode_duration(m.total_duration.as_deref())?,
            waiting: decode_duration(m.wait_duration.as_deref())?,
            service: decode_duration(m.visit_duration.as_deref())?,
        },
        None => SolutionTotals {
            service: visits.iter().map(|v| v.service_time).sum(),
            waiting: visits.iter().map(|v| v.waiting_time).sum(),
            ..SolutionTotals::default()
        },
    };

    let mut solution = RoutingSolution {
        visits,
        totals,
        unassigned,
        geometry: route.route_polyline.map(|p| p.points),
        backend: UPSTREAM.to_string(),
    };
    let unknown = solution.reconcile(problem);
    if !unknown.is_empty() {
        return Err(RoutingError::InvalidResponse(format!(
            "hosted optimization referenced unknown stops {:?}",
            unknown
        )));
    }
    Ok(solution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geo::Coordinate;
    use crate::models::routing::{Stop, TimeWindow};
    use serde_json::json;

    fn problem() -> RoutingProblem {
        RoutingProblem {
            stops: vec![
                Stop {
                    id: 10,
                    location: Coordinate::new(48.85, 2.35),
                    service_secs: 600,
                    time_window: Some(TimeWindow::new(28_800, 32_400)),
                    priority: None,
                },
                Stop {
                    id: 11,
                    location: Coordinate::new(48.90, 2.40),
                    service_secs: 300,
                    time_window: None,
                    priority: Some(50),
                },
            ],
            start: Some(Coordinate::new(48.80, 2.30)),
            end: Some(Coordinate::new(48.80, 2.30)),
            vehicle_window: TimeWindow::new(25_200, 61_200),
        }
    }

    #[test]
    fn test_time_encoding_stays_on_epoch_day() {
        assert_eq!(encode_time(28_800), "1970-01-01T08:00:00Z");
        assert_eq!(decode_time("1970-01-01T08:00:00Z").unwrap(), 28_800);
        assert_eq!(decode_duration(Some("12.4s")).unwrap(), 12);
        assert_eq!(decode_duration(None).unwrap(), 0);
        assert!(decode_duration(Some("12m")).is_err());
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(HostedOptimizationBackend::request_body(&problem())).unwrap();

        let shipment = &body["model"]["shipments"][0];
        assert_eq!(shipment["label"], json!("10"));
        assert_eq!(shipment["deliveries"][0]["duration"], json!("600s"));
        assert_eq!(
            shipment["deliveries"][0]["timeWindows"][0]["startTime"],
            json!("1970-01-01T08:00:00Z")
        );
        assert!(body["model"]["shipments"][1]["deliveries"][0]
            .get("timeWindows")
            .is_none());
        assert!(
            body["model"]["shipments"][1]["penaltyCost"].as_f64().unwrap()
                > shipment["penaltyCost"].as_f64().unwrap()
        );
        assert_eq!(
            body["model"]["vehicles"][0]["startTimeWindows"][0]["startTime"],
            json!("1970-01-01T07:00:00Z")
        );
    }

    #[test]
    fn test_parses_visits_with_omitted_zero_index() {
        let response: OptimizeToursResponse = serde_json::from_value(json!({
            "routes": [{
                "visits": [
                    {"startTime": "1970-01-01T08:00:00Z"},
                    {"shipmentIndex": 1, "startTime": "1970-01-01T09:00:00Z"}
                ],
                "transitions": [
                    {"waitDuration": "120s", "travelDistanceMeters": 4000.0},
                    {"travelDistanceMeters": 5000.0},
                    {}
                ],
                "metrics": {
                    "travelDistanceMeters": 9000.0,
                    "totalDuration": "7200s",
                    "waitDuration": "120s",
                    "visitDuration": "900s"
                },
                "routePolyline": {"points": "xyz"}
            }]
        }))
        .unwrap();

        let solution = into_solution(response, &problem()).unwrap();

        assert_eq!(solution.visits.len(), 2);
        assert_eq!(solution.visits[0].stop_id, 10);
        assert_eq!(solution.visits[0].arrival, 28_680);
        assert_eq!(solution.visits[0].waiting_time, 120);
        assert_eq!(solution.visits[1].stop_id, 11);
        assert_eq!(solution.visits[1].service_time, 300);
        assert!(solution.unassigned.is_empty());
        assert_eq!(solution.totals.duration, 7200);
        assert_eq!(solution.geometry.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_skipped_shipments_become_unassigned() {
        let response: OptimizeToursResponse = serde_json::from_value(json!({
            "routes": [{"visits": [{"shipmentIndex": 1, "startTime": "1970-01-01T09:00:00Z"}]}],
            "skippedShipments": [{"label": "10"}]
        }))
        .unwrap();

        let solution = into_solution(response, &problem()).unwrap();

        assert_eq!(solution.visits.len(), 1);
        assert_eq!(solution.unassigned, vec![10]);
    }

    #[tokio::test]
    async fn test_health_checks_credential_presence_only() {
        let missing = HostedOptimizationBackend::new(
            "http://127.0.0.1:1",
            Some("proj".into()),
            None,
            Duration::from_secs(1),
        );
        assert!(!missing.health().await.available);

        let configured = HostedOptimizationBackend::new(
            "http://127.0.0.1:1",
            Some("proj".into()),
            Some("token".into()),
            Duration::from_secs(1),
        );
        let health = configured.health().await;
        assert!(health.available);
        assert!(health.description.contains("proj"));
    }
}
