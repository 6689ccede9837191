//! Summary statistics over the task instance collection.

use crate::task_store::StoredDocument;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

const RECENT_ASSIGNMENTS: usize = 10;
const LOW_AVAILABILITY_OCCUPATIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentAssignment {
    pub task_id: String,
    pub occupation_id: String,
    pub assigned_at: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupationAvailability {
    pub occupation_id: String,
    pub available_percent: f64,
    pub available: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub timestamp: String,
    pub timezone: String,
    pub total_tasks: usize,
    pub available_tasks: usize,
    pub unavailable_tasks: usize,
    pub availability_percentage: f64,
    pub assignments_last_24h: usize,
    pub assignments_last_hour: usize,
    pub recent_assignments: Vec<RecentAssignment>,
    pub total_occupations: usize,
    pub occupations_unavailable: usize,
    pub occupations_available: usize,
    pub low_availability_occupations: Vec<OccupationAvailability>,
    pub assignment_rate_per_hour: f64,
    /// `None` while nothing has been assigned in the last day.
    pub estimated_hours_remaining: Option<f64>,
    pub estimated_depletion_date: Option<String>,
}

/// An occupation with nothing left to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavailableOccupation {
    pub occupation_id: String,
    pub depleted_at: String,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Default)]
struct Counts {
    total: usize,
    available: usize,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

#[must_use]
pub fn compute_dashboard(docs: &[StoredDocument], now: DateTime<Utc>) -> DashboardStats {
    let last_24h = now - Duration::hours(24);
    let last_hour = now - Duration::hours(1);

    let mut occupations: BTreeMap<String, Counts> = BTreeMap::new();
    let mut available_tasks = 0;
    let mut assignments_24h = 0;
    let mut assignments_1h = 0;
    let mut recent: Vec<(DateTime<Utc>, RecentAssignment)> = Vec::new();

    for doc in docs {
        let available = doc.is_available();
        let occupation_id = doc.str_field("occupation_id").unwrap_or("unknown");
        let counts = occupations.entry(occupation_id.to_string()).or_default();
        counts.total += 1;
        if available {
            available_tasks += 1;
            counts.available += 1;
            continue;
        }

        let Some(assigned_at) = doc.assigned_at() else {
            continue;
        };
        if assigned_at > last_24h {
            assignments_24h += 1;
            if assigned_at > last_hour {
                assignments_1h += 1;
            }
        }
        recent.push((
            assigned_at,
            RecentAssignment {
                task_id: doc.str_field("task_id").unwrap_or("unknown").to_string(),
                occupation_id: occupation_id.to_string(),
                assigned_at: assigned_at.to_rfc3339(),
                doc_id: doc.id.clone(),
            },
        ));
    }

    recent.sort_by(|a, b| b.0.cmp(&a.0));
    let recent_assignments = recent
        .into_iter()
        .take(RECENT_ASSIGNMENTS)
        .map(|(_, r)| r)
        .collect();

    let mut low_availability: Vec<OccupationAvailability> = occupations
        .iter()
        .map(|(id, c)| OccupationAvailability {
            occupation_id: id.clone(),
            available_percent: percent(c.available, c.total),
            available: c.available,
            total: c.total,
        })
        .collect();
    low_availability.sort_by(|a, b| a.available_percent.total_cmp(&b.available_percent));
    low_availability.truncate(LOW_AVAILABILITY_OCCUPATIONS);

    let occupations_unavailable = occupations.values().filter(|c| c.available == 0).count();
    let total_tasks = docs.len();
    let assignment_rate_per_hour = round2(assignments_24h as f64 / 24.0);
    let (estimated_hours_remaining, estimated_depletion_date) = if assignment_rate_per_hour > 0.0 {
        let hours = available_tasks as f64 / assignment_rate_per_hour;
        let depletion = now + Duration::seconds((hours * 3600.0) as i64);
        (
            Some(round2(hours)),
            Some(depletion.format("%Y-%m-%d %H:%M").to_string()),
        )
    } else {
        (None, None)
    };

    DashboardStats {
        timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        timezone: "UTC".to_string(),
        total_tasks,
        available_tasks,
        unavailable_tasks: total_tasks - available_tasks,
        availability_percentage: percent(available_tasks, total_tasks),
        assignments_last_24h: assignments_24h,
        assignments_last_hour: assignments_1h,
        recent_assignments,
        total_occupations: occupations.len(),
        occupations_unavailable,
        occupations_available: occupations.len() - occupations_unavailable,
        low_availability_occupations: low_availability,
        assignment_rate_per_hour,
        estimated_hours_remaining,
        estimated_depletion_date,
    }
}

/// Occupations with no available instance, newest depletion first. The
/// depletion time is the latest `assigned_at` among the occupation's
/// instances, or `now` when none is recorded.
#[must_use]
pub fn compute_unavailable_occupations(
    docs: &[StoredDocument],
    now: DateTime<Utc>,
) -> Vec<UnavailableOccupation> {
    let mut latest: BTreeMap<&str, Option<DateTime<Utc>>> = BTreeMap::new();
    let mut has_available: BTreeMap<&str, bool> = BTreeMap::new();

    for doc in docs {
        let Some(occupation_id) = doc.str_field("occupation_id") else {
            continue;
        };
        *has_available.entry(occupation_id).or_default() |= doc.is_available();
        let entry = latest.entry(occupation_id).or_default();
        if let Some(t) = doc.assigned_at() {
            if entry.is_none_or(|current| t > current) {
                *entry = Some(t);
            }
        }
    }

    let mut result: Vec<(DateTime<Utc>, UnavailableOccupation)> = has_available
        .into_iter()
        .filter(|(_, available)| !available)
        .map(|(id, _)| {
            let depleted = latest.get(id).copied().flatten().unwrap_or(now);
            (
                depleted,
                UnavailableOccupation {
                    occupation_id: id.to_string(),
                    depleted_at: depleted.to_rfc3339(),
                },
            )
        })
        .collect();
    result.sort_by(|a, b| b.0.cmp(&a.0));
    result.into_iter().map(|(_, o)| o).collect()
}
