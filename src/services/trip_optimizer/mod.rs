//! Single-vehicle trip optimization with time windows.
//!
//! [`TripOptimizer`] turns planning-screen stops into a [`RoutingProblem`],
//! fingerprints it for the cache and hands it to a [`SolverBackend`].

pub mod hosted;
pub mod vroom;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheAside;
use crate::config::SolverConfig;
use crate::error::RoutingError;
use crate::models::geo::Coordinate;
use crate::models::routing::{RoutingProblem, RoutingSolution, Stop, TimeWindow, TripStop};
use crate::utils::{seconds_since_midnight, Fingerprint, END_OF_DAY_SECS};

pub use hosted::HostedOptimizationBackend;
pub use vroom::VroomBackend;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverHealth {
    pub backend: String,
    pub available: bool,
    pub description: String,
}

#[async_trait]
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, problem: &RoutingProblem) -> Result<RoutingSolution, RoutingError>;

    async fn health(&self) -> SolverHealth;
}

#[derive(Clone, Debug)]
pub struct TripRequestOptions {
    /// Start and end of the tour. Without a depot the tour starts at the
    /// first stop and ends wherever the solver finishes.
    pub depot: Option<Coordinate>,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub use_cache: bool,
}

impl TripRequestOptions {
    pub fn starting_at(start_time: DateTime<FixedOffset>) -> Self {
        Self {
            depot: None,
            start_time,
            end_time: None,
            use_cache: true,
        }
    }
}

/// Prefers the self-hosted solver, falls back to the hosted API.
pub fn select_backend(config: &SolverConfig) -> Option<Arc<dyn SolverBackend>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    if let Some(url) = config.vroom_url.as_deref().filter(|u| !u.is_empty()) {
        return Some(Arc::new(VroomBackend::new(url, timeout)));
    }
    if config.hosted_project.is_some() || config.hosted_token.is_some() {
        return Some(Arc::new(HostedOptimizationBackend::new(
            &config.hosted_url,
            config.hosted_project.clone(),
            config.hosted_token.clone(),
            timeout,
        )));
    }
    None
}

pub struct TripOptimizer {
    backend: Option<Arc<dyn SolverBackend>>,
    cache: CacheAside,
    ttl: Duration,
}

impl TripOptimizer {
    pub fn new(backend: Option<Arc<dyn SolverBackend>>, cache: CacheAside, ttl: Duration) -> Self {
        Self {
            backend,
            cache,
            ttl,
        }
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub async fn optimize_trip(
        &self,
        stops: &[TripStop],
        opts: &TripRequestOptions,
    ) -> Result<RoutingSolution, RoutingError> {
        if stops.len() < 2 {
            return Err(RoutingError::InsufficientInput(format!(
                "trip optimization needs at least 2 stops, got {}",
                stops.len()
            )));
        }
        let problem = build_problem(stops, opts)?;
        self.solve(&problem, opts.use_cache).await
    }

    /// Solves an already-built problem. Also used directly by callers that
    /// work in seconds since midnight.
    pub async fn solve(
        &self,
        problem: &RoutingProblem,
        use_cache: bool,
    ) -> Result<RoutingSolution, RoutingError> {
        validate_problem(problem)?;
        let backend = self.backend.as_ref().ok_or_else(|| {
            RoutingError::Unreachable("no trip solver backend configured".to_string())
        })?;

        let key = problem_fingerprint(problem);
        let started = std::time::Instant::now();
        let result = if use_cache {
            self.cache
                .get_or_compute(&key, self.ttl, || backend.solve(problem))
                .await
        } else {
            backend.solve(problem).await
        };

        match &result {
            Ok(solution) => tracing::info!(
                backend = backend.name(),
                stops = problem.stops.len(),
                assigned = solution.visits.len(),
                unassigned = solution.unassigned.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "trip optimized"
            ),
            Err(e) => tracing::error!(
                backend = backend.name(),
                stops = problem.stops.len(),
                kind = e.kind(),
                error = %e,
                "trip optimization failed"
            ),
        }
        result
    }

    pub async fn health(&self) -> SolverHealth {
        match &self.backend {
            Some(backend) => backend.health().await,
            None => SolverHealth {
                backend: "none".to_string(),
                available: false,
                description: "no trip solver backend configured".to_string(),
            },
        }
    }
}

/// Converts planning-screen stops into a solver problem.
///
/// Stop windows and the vehicle window both use the local wall clock of the
/// value they come from. A stop window that collapses (`start >= end`) after
/// conversion is dropped and logged.
pub fn build_problem(
    stops: &[TripStop],
    opts: &TripRequestOptions,
) -> Result<RoutingProblem, RoutingError> {
    let vehicle_start = seconds_since_midnight(&opts.start_time);
    let vehicle_end = match &opts.end_time {
        Some(end) => {
            if end <= &opts.start_time {
                return Err(RoutingError::MalformedInput(format!(
                    "vehicle window ends ({}) before it starts ({})",
                    end, opts.start_time
                )));
            }
            if end.date_naive() != opts.start_time.date_naive() {
                END_OF_DAY_SECS
            } else {
                seconds_since_midnight(end)
            }
        }
        None => END_OF_DAY_SECS,
    };

    let stops = stops
        .iter()
        .map(|stop| Stop {
            id: stop.id,
            location: stop.location,
            service_secs: stop.service_minutes.saturating_mul(60),
            time_window: stop.creneau.as_ref().and_then(|creneau| {
                let window = TimeWindow::new(
                    seconds_since_midnight(&creneau.start),
                    seconds_since_midnight(&creneau.end),
                );
                if window.is_empty() {
                    tracing::warn!(
                        stop_id = stop.id,
                        creneau_start = %creneau.start,
                        creneau_end = %creneau.end,
                        window_start = window.start,
                        window_end = window.end,
                        "dropping empty time window after local-time conversion"
                    );
                    return None;
                }
                Some(window)
            }),
            priority: stop.priority.map(|p| p.min(100)),
        })
        .collect::<Vec<_>>();

    let start = opts
        .depot
        .or_else(|| stops.first().map(|s| s.location));

    Ok(RoutingProblem {
        stops,
        start,
        end: opts.depot,
        vehicle_window: TimeWindow::new(vehicle_start, vehicle_end),
    })
}

fn validate_problem(problem: &RoutingProblem) -> Result<(), RoutingError> {
    if problem.stops.len() < 2 {
        return Err(RoutingError::InsufficientInput(format!(
            "trip optimization needs at least 2 stops, got {}",
            problem.stops.len()
        )));
    }
    if let Some(stop) = problem.stops.iter().find(|s| !s.location.is_valid()) {
        return Err(RoutingError::MalformedInput(format!(
            "stop {} has an invalid coordinate",
            stop.id
        )));
    }
    for endpoint in [problem.start, problem.end].into_iter().flatten() {
        if !endpoint.is_valid() {
            return Err(RoutingError::MalformedInput(
                "vehicle endpoint has an invalid coordinate".to_string(),
            ));
        }
    }
    let mut ids: Vec<usize> = problem.stops.iter().map(|s| s.id).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != problem.stops.len() {
        return Err(RoutingError::MalformedInput("duplicate stop ids".to_string()));
    }
    if problem.vehicle_window.is_empty() {
        return Err(RoutingError::MalformedInput(format!(
            "empty vehicle window [{}, {})",
            problem.vehicle_window.start, problem.vehicle_window.end
        )));
    }
    Ok(())
}

/// Any change to a location, service duration, window, priority, depot or
/// vehicle window yields a different key.
pub fn problem_fingerprint(problem: &RoutingProblem) -> String {
    let mut key = Fingerprint::new("trip");
    for stop in &problem.stops {
        key.field("stop", stop.id)
            .coordinate(&stop.location)
            .field("service", stop.service_secs)
            .optional(
                "window",
                stop.time_window.map(|w| format!("{}-{}", w.start, w.end)),
            )
            .optional("priority", stop.priority);
    }
    match problem.start {
        Some(start) => key.field("start", "").coordinate(&start),
        None => key.field("start", "-"),
    };
    match problem.end {
        Some(end) => key.field("end", "").coordinate(&end),
        None => key.field("end", "-"),
    };
    key.field("vehicle_start", problem.vehicle_window.start)
        .field("vehicle_end", problem.vehicle_window.end);
    key.finish()
}
