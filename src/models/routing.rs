use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::geo::Coordinate;

/// Half-open interval `[start, end)` in seconds since local midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: u32,
    pub end: u32,
}

impl TimeWindow {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, secs: u32) -> bool {
        secs >= self.start && secs <= self.end
    }
}

/// A stop as the solver sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: usize,
    pub location: Coordinate,
    pub service_secs: u32,
    pub time_window: Option<TimeWindow>,
    pub priority: Option<u32>,
}

/// Delivery slot as entered by the operator, in the stop's own local time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Creneau {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

/// A stop as the planning screens submit it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripStop {
    pub id: usize,
    pub location: Coordinate,
    pub service_minutes: u32,
    #[serde(default)]
    pub creneau: Option<Creneau>,
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingProblem {
    pub stops: Vec<Stop>,
    pub start: Option<Coordinate>,
    pub end: Option<Coordinate>,
    pub vehicle_window: TimeWindow,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub stop_id: usize,
    pub arrival: u32,
    pub waiting_time: u32,
    pub service_time: u32,
    #[serde(default)]
    pub distance: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SolutionTotals {
    pub distance: f64,
    pub duration: u32,
    pub waiting: u32,
    pub service: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingSolution {
    pub visits: Vec<Visit>,
    pub totals: SolutionTotals,
    pub unassigned: Vec<usize>,
    pub geometry: Option<String>,
    pub backend: String,
}

impl RoutingSolution {
    /// Makes `visits + unassigned` cover every input stop exactly once.
    ///
    /// Stops the solver neither routed nor reported are appended to
    /// `unassigned`. Returns the ids that the solver mentioned but that are not
    /// part of the problem.
    pub fn reconcile(&mut self, problem: &RoutingProblem) -> Vec<usize> {
        let known: HashSet<usize> = problem.stops.iter().map(|s| s.id).collect();
        let mut seen = HashSet::new();
        let mut unknown = Vec::new();

        self.visits.retain(|visit| {
            if !known.contains(&visit.stop_id) {
                unknown.push(visit.stop_id);
                return false;
            }
            seen.insert(visit.stop_id)
        });
        self.unassigned.retain(|id| {
            if !known.contains(id) {
                unknown.push(*id);
                return false;
            }
            seen.insert(*id)
        });

        for stop in &problem.stops {
            if !seen.contains(&stop.id) {
                self.unassigned.push(stop.id);
            }
        }
        unknown
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub distance: f64,
    pub duration: f64,
    #[serde(default)]
    pub summary: String,
}

/// Point-to-point route through the given coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub distance: f64,
    pub duration: f64,
    pub geometry: Option<String>,
    pub legs: Vec<RouteLeg>,
}

/// Square matrices indexed `[from][to]`. `None` marks unroutable pairs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceMatrix {
    pub distances: Vec<Vec<Option<f64>>>,
    pub durations: Vec<Vec<Option<f64>>>,
}

/// Visit order computed without time windows (round-trip TSP).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderedRoute {
    /// Input indices in visiting order.
    pub order: Vec<usize>,
    pub distance: f64,
    pub duration: f64,
    pub geometry: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(ids: &[usize]) -> RoutingProblem {
        RoutingProblem {
            stops: ids
                .iter()
                .map(|id| Stop {
                    id: *id,
                    location: Coordinate::new(48.85, 2.35),
                    service_secs: 60,
                    time_window: None,
                    priority: None,
                })
                .collect(),
            start: None,
            end: None,
            vehicle_window: TimeWindow::new(0, 86_399),
        }
    }

    fn visit(stop_id: usize) -> Visit {
        Visit {
            stop_id,
            arrival: 0,
            waiting_time: 0,
            service_time: 60,
            distance: None,
        }
    }

    #[test]
    fn test_reconcile_reports_missing_stops_as_unassigned() {
        let problem = problem(&[0, 1, 2]);
        let mut solution = RoutingSolution {
            visits: vec![visit(1)],
            totals: SolutionTotals::default(),
            unassigned: vec![],
            geometry: None,
            backend: "test".into(),
        };

        let unknown = solution.reconcile(&problem);

        assert!(unknown.is_empty());
        assert_eq!(solution.visits.len() + solution.unassigned.len(), 3);
        assert_eq!(solution.unassigned, vec![0, 2]);
    }

    #[test]
    fn test_reconcile_drops_duplicates_and_unknown_ids() {
        let problem = problem(&[0, 1]);
        let mut solution = RoutingSolution {
            visits: vec![visit(0), visit(0), visit(7)],
            totals: SolutionTotals::default(),
            unassigned: vec![1, 1],
            geometry: None,
            backend: "test".into(),
        };

        let unknown = solution.reconcile(&problem);

        assert_eq!(unknown, vec![7]);
        assert_eq!(solution.visits.len(), 1);
        assert_eq!(solution.unassigned, vec![1]);
    }

    #[test]
    fn test_empty_window() {
        assert!(TimeWindow::new(100, 100).is_empty());
        assert!(!TimeWindow::new(100, 101).is_empty());
    }
}
