//! Self-hosted VROOM (vroom-express) backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{SolverBackend, SolverHealth};
use crate::error::RoutingError;
use crate::models::routing::{RoutingProblem, RoutingSolution, SolutionTotals, Visit};
use crate::services::upstream::{build_client, decode, execute, snippet};

const UPSTREAM: &str = "vroom";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct VroomRequest {
    vehicles: Vec<VroomVehicle>,
    jobs: Vec<VroomJob>,
    options: VroomOptions,
}

#[derive(Serialize)]
struct VroomVehicle {
    id: u32,
    profile: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<[f64; 2]>,
    time_window: [u32; 2],
}

#[derive(Serialize)]
struct VroomJob {
    id: usize,
    location: [f64; 2],
    service: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    time_windows: Vec<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
}

#[derive(Serialize)]
struct VroomOptions {
    g: bool,
}

#[derive(Deserialize)]
struct VroomResponse {
    code: i32,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    summary: Option<VroomSummary>,
    #[serde(default)]
    unassigned: Vec<VroomUnassigned>,
    #[serde(default)]
    routes: Vec<VroomRoute>,
}

#[derive(Deserialize)]
struct VroomSummary {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: u32,
    #[serde(default)]
    waiting_time: u32,
    #[serde(default)]
    service: u32,
}

#[derive(Deserialize)]
struct VroomUnassigned {
    id: usize,
}

#[derive(Deserialize)]
struct VroomRoute {
    steps: Vec<VroomStep>,
    #[serde(default)]
    geometry: Option<String>,
}

#[derive(Deserialize)]
struct VroomStep {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<usize>,
    /// Pre-1.12 name of `id`.
    #[serde(default)]
    job: Option<usize>,
    arrival: u32,
    #[serde(default)]
    waiting_time: u32,
    #[serde(default)]
    service: u32,
    #[serde(default)]
    distance: Option<f64>,
}

pub struct VroomBackend {
    http: reqwest::Client,
    base_url: String,
}

impl VroomBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request_body(problem: &RoutingProblem) -> VroomRequest {
        VroomRequest {
            vehicles: vec![VroomVehicle {
                id: 1,
                profile: "car",
                start: problem.start.map(|c| c.lon_lat()),
                end: problem.end.map(|c| c.lon_lat()),
                time_window: [problem.vehicle_window.start, problem.vehicle_window.end],
            }],
            jobs: problem
                .stops
                .iter()
                .map(|stop| VroomJob {
                    id: stop.id,
                    location: stop.location.lon_lat(),
                    service: stop.service_secs,
                    time_windows: stop
                        .time_window
                        .map(|w| vec![[w.start, w.end]])
                        .unwrap_or_default(),
                    priority: stop.priority,
                })
                .collect(),
            options: VroomOptions { g: true },
        }
    }
}

#[async_trait]
impl SolverBackend for VroomBackend {
    fn name(&self) -> &'static str {
        UPSTREAM
    }

    async fn solve(&self, problem: &RoutingProblem) -> Result<RoutingSolution, RoutingError> {
        let body = Self::request_body(problem);
        let response = execute(self.http.post(&self.base_url).json(&body), UPSTREAM).await?;

        // vroom-express answers input and routing errors with a JSON body and
        // a 4xx/5xx status, so the body is decoded before the status is judged.
        match serde_json::from_str::<VroomResponse>(&response.body) {
            Ok(parsed) => into_solution(parsed, problem),
            Err(_) if !response.status.is_success() => Err(RoutingError::Rejected {
                status: response.status.as_u16(),
                message: snippet(&response.body),
            }),
            Err(_) => decode::<VroomResponse>(&response.body, UPSTREAM)
                .and_then(|parsed| into_solution(parsed, problem)),
        }
    }

    async fn health(&self) -> SolverHealth {
        let url = format!("{}/health", self.base_url);
        let probe = self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await;
        let (available, description) = match probe {
            Ok(resp) if resp.status().is_success() => {
                (true, format!("vroom reachable at {}", self.base_url))
            }
            Ok(resp) => (
                false,
                format!("vroom at {} answered {}", self.base_url, resp.status()),
            ),
            Err(e) => (
                false,
                format!("vroom at {} unreachable: {}", self.base_url, e),
            ),
        };
        SolverHealth {
            backend: UPSTREAM.to_string(),
            available,
            description,
        }
    }
}

fn into_solution(
    response: VroomResponse,
    problem: &RoutingProblem,
) -> Result<RoutingSolution, RoutingError> {
    let message = response.error.unwrap_or_default();
    match response.code {
        0 => {}
        2 => {
            return Err(RoutingError::Rejected {
                status: 400,
                message: format!("vroom input error: {}", message),
            })
        }
        3 => {
            return Err(RoutingError::NoSolution(format!(
                "vroom routing error: {}",
                message
            )))
        }
        code => {
            return Err(RoutingError::Rejected {
                status: 500,
                message: format!("vroom error code {}: {}", code, message),
            })
        }
    }

    let route = response.routes.into_iter().next();
    let (visits, geometry) = match route {
        Some(route) => {
            let mut visits = Vec::new();
            for step in route.steps.into_iter().filter(|s| s.kind == "job") {
                let stop_id = step.id.or(step.job).ok_or_else(|| {
                    RoutingError::InvalidResponse("vroom job step without id".to_string())
                })?;
                visits.push(Visit {
                    stop_id,
                    arrival: step.arrival,
                    waiting_time: step.waiting_time,
                    service_time: step.service,
                    distance: step.distance,
                });
            }
            (visits, route.geometry)
        }
        None => (Vec::new(), None),
    };

    if visits.is_empty() {
        return Err(RoutingError::NoSolution(format!(
            "vroom could not assign any of the {} stops",
            problem.stops.len()
        )));
    }

    let totals = response
        .summary
        .map(|s| SolutionTotals {
            distance: s.distance,
            duration: s.duration,
            waiting: s.waiting_time,
            service: s.service,
        })
        .unwrap_or_default();

    let mut solution = RoutingSolution {
        visits,
        totals,
        unassigned: response.unassigned.into_iter().map(|u| u.id).collect(),
        geometry,
        backend: UPSTREAM.to_string(),
    };
    let unknown = solution.reconcile(problem);
    if !unknown.is_empty() {
        return Err(RoutingError::InvalidResponse(format!(
            "vroom referenced unknown stop ids {:?}",
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
                    id: 0,
                    location: Coordinate::new(48.85, 2.35),
                    service_secs: 600,
                    time_window: Some(TimeWindow::new(28_800, 32_400)),
                    priority: Some(10),
                },
                Stop {
                    id: 1,
                    location: Coordinate::new(48.90, 2.40),
                    service_secs: 300,
                    time_window: None,
                    priority: None,
                },
            ],
            start: Some(Coordinate::new(48.80, 2.30)),
            end: None,
            vehicle_window: TimeWindow::new(25_200, 61_200),
        }
    }

    #[test]
    fn test_request_body_is_longitude_first() {
        let body = serde_json::to_value(VroomBackend::request_body(&problem())).unwrap();

        assert_eq!(body["vehicles"][0]["start"], json!([2.30, 48.80]));
        assert!(body["vehicles"][0].get("end").is_none());
        assert_eq!(body["vehicles"][0]["time_window"], json!([25_200, 61_200]));
        assert_eq!(body["jobs"][0]["location"], json!([2.35, 48.85]));
        assert_eq!(body["jobs"][0]["time_windows"], json!([[28_800, 32_400]]));
        assert_eq!(body["jobs"][0]["priority"], json!(10));
        assert!(body["jobs"][1].get("time_windows").is_none());
        assert_eq!(body["options"]["g"], json!(true));
    }

    #[test]
    fn test_parses_steps_and_unassigned() {
        let response: VroomResponse = serde_json::from_value(json!({
            "code": 0,
            "summary": {"distance": 9000.0, "duration": 1500, "waiting_time": 60, "service": 600},
            "unassigned": [{"id": 1, "location": [2.40, 48.90]}],
            "routes": [{
                "vehicle": 1,
                "geometry": "abc",
                "steps": [
                    {"type": "start", "arrival": 25200},
                    {"type": "job", "job": 0, "arrival": 28740, "waiting_time": 60, "service": 600, "distance": 9000.0},
                    {"type": "end", "arrival": 29400}
                ]
            }]
        }))
        .unwrap();

        let solution = into_solution(response, &problem()).unwrap();

        assert_eq!(solution.visits.len(), 1);
        assert_eq!(solution.visits[0].stop_id, 0);
        assert_eq!(solution.visits[0].waiting_time, 60);
        assert_eq!(solution.unassigned, vec![1]);
        assert_eq!(solution.totals.service, 600);
        assert_eq!(solution.geometry.as_deref(), Some("abc"));
    }

    #[test]
    fn test_error_codes_are_classified() {
        let routing: VroomResponse =
            serde_json::from_value(json!({"code": 3, "error": "Unfound route"})).unwrap();
        assert!(matches!(
            into_solution(routing, &problem()),
            Err(RoutingError::NoSolution(_))
        ));

        let input: VroomResponse =
            serde_json::from_value(json!({"code": 2, "error": "Invalid jobs"})).unwrap();
        assert!(matches!(
            into_solution(input, &problem()),
            Err(RoutingError::Rejected { status: 400, .. })
        ));
    }

    #[test]
    fn test_nothing_assigned_is_no_solution() {
        let response: VroomResponse = serde_json::from_value(json!({
            "code": 0,
            "unassigned": [{"id": 0}, {"id": 1}],
            "routes": []
        }))
        .unwrap();

        assert!(matches!(
            into_solution(response, &problem()),
            Err(RoutingError::NoSolution(_))
        ));
    }
}
