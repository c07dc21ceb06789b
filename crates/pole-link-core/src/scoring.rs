use std::cmp::Ordering;

use crate::candidates::MatchCandidate;
use crate::config::ReconciliationConfig;
use crate::model::MatchReason;

pub const GPS_WEIGHT_CAP: f64 = 0.6;
pub const AGENT_NAME_WEIGHT: f64 = 0.25;
pub const ADDRESS_WEIGHT: f64 = 0.15;

/// A candidate with its confidence and the weighted components behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: MatchCandidate,
    pub confidence: f64,
    pub gps_component: f64,
    pub agent_component: f64,
    pub address_component: f64,
}

impl ScoredCandidate {
    /// GPS carried at least as much weight as every other signal and no identifier matched.
    #[must_use]
    pub fn gps_dominant(&self) -> bool {
        !self.candidate.has_exact_identifier()
            && self.candidate.has_reason(MatchReason::GpsProximity)
            && self.gps_component >= self.agent_component
            && self.gps_component >= self.address_component
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Score one candidate.
///
/// An exact identifier match pins confidence at 1.0. Otherwise confidence is the sum of the
/// GPS component (`1 - distance / radius`, clamped to [0, 0.6]), agent-name similarity x 0.25
/// when it clears the threshold, and address similarity x 0.15 when it clears its threshold,
/// clamped to [0, 1].
#[must_use]
pub fn score_candidate(
    candidate: MatchCandidate,
    config: &ReconciliationConfig,
) -> ScoredCandidate {
    let gps_component = match candidate.distance_meters {
        Some(distance) if candidate.has_reason(MatchReason::GpsProximity) => {
            finite_or_zero(1.0 - distance / config.gps_proximity_meters).clamp(0.0, GPS_WEIGHT_CAP)
        }
        _ => 0.0,
    };

    let agent_component = match candidate.agent_name_similarity {
        Some(similarity) if similarity >= config.agent_name_similarity_threshold => {
            finite_or_zero(similarity * AGENT_NAME_WEIGHT)
        }
        _ => 0.0,
    };

    let address_component = match candidate.address_similarity {
        Some(similarity) if candidate.has_reason(MatchReason::AddressSimilar) => {
            finite_or_zero(similarity * ADDRESS_WEIGHT)
        }
        _ => 0.0,
    };

    let confidence = if candidate.has_exact_identifier() {
        1.0
    } else {
        finite_or_zero(gps_component + agent_component + address_component).clamp(0.0, 1.0)
    };

    ScoredCandidate { candidate, confidence, gps_component, agent_component, address_component }
}

fn cmp_ranked(lhs: &ScoredCandidate, rhs: &ScoredCandidate) -> Ordering {
    rhs.confidence
        .partial_cmp(&lhs.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| cmp_distance(lhs.candidate.distance_meters, rhs.candidate.distance_meters))
        .then_with(|| lhs.candidate.assignment.created_at.cmp(&rhs.candidate.assignment.created_at))
        .then_with(|| lhs.candidate.assignment_id().cmp(rhs.candidate.assignment_id()))
}

// Unknown distance sorts after any known distance.
fn cmp_distance(lhs: Option<f64>, rhs: Option<f64>) -> Ordering {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Order best first: confidence desc, distance asc, assignment created_at asc, assignment id asc.
#[must_use]
pub fn rank_candidates(mut scored: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    scored.sort_by(cmp_ranked);
    scored
}

#[must_use]
pub fn score_and_rank(
    candidates: Vec<MatchCandidate>,
    config: &ReconciliationConfig,
) -> Vec<ScoredCandidate> {
    rank_candidates(
        candidates.into_iter().map(|candidate| score_candidate(candidate, config)).collect(),
    )
}
