use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::model::ReconciliationReport;

/// Stored link counts for one project, as read from the link table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusCounts {
    pub total_permissions: usize,
    pub linked: usize,
    pub conflict: usize,
    pub duplicate: usize,
}

/// Dashboard projection of a project's linking progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkingStatusSummary {
    pub project_id: String,
    pub total_permissions: usize,
    pub linked_count: usize,
    pub conflict_count: usize,
    pub duplicate_count: usize,
    pub pending_count: usize,
    /// Percent of permissions that are LINKED.
    pub linking_rate: f64,
    /// Percent of permissions in CONFLICT.
    pub conflict_rate: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reconciled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_reconciliation_at: Option<OffsetDateTime>,
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

#[must_use]
pub fn summarize(
    project_id: &str,
    counts: StatusCounts,
    latest_report: Option<&ReconciliationReport>,
    interval_hours: u32,
) -> LinkingStatusSummary {
    let pending_count = counts
        .total_permissions
        .saturating_sub(counts.linked)
        .saturating_sub(counts.conflict)
        .saturating_sub(counts.duplicate);
    let last_reconciled_at = latest_report.map(|report| report.completed_at);

    LinkingStatusSummary {
        project_id: project_id.to_string(),
        total_permissions: counts.total_permissions,
        linked_count: counts.linked,
        conflict_count: counts.conflict,
        duplicate_count: counts.duplicate,
        pending_count,
        linking_rate: percent(counts.linked, counts.total_permissions),
        conflict_rate: percent(counts.conflict, counts.total_permissions),
        last_reconciled_at,
        next_reconciliation_at: last_reconciled_at
            .map(|at| at + Duration::hours(i64::from(interval_hours))),
    }
}
