use std::collections::BTreeMap;

use crate::config::ReconciliationConfig;
use crate::model::{AssignmentRecord, Link, MatchReason, PermissionRecord};
use crate::similarity::{address_similarity, agent_name_similarity};
use crate::store::{ExactKey, RecordStore};
use crate::{AssignmentId, EngineError};

/// One plausible assignment for a permission, with the signals that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub assignment: AssignmentRecord,
    /// Sorted, without duplicates.
    pub reasons: Vec<MatchReason>,
    pub distance_meters: Option<f64>,
    pub agent_name_similarity: Option<f64>,
    pub address_similarity: Option<f64>,
    /// LINKED link already holding this assignment for a different permission.
    pub linked_elsewhere: Option<Link>,
    /// Without a LINKED holder: the oldest CONFLICT or DUPLICATE_POLE link of another
    /// permission that still claims this assignment.
    pub under_review_elsewhere: Option<Link>,
}

impl MatchCandidate {
    #[must_use]
    pub fn assignment_id(&self) -> &AssignmentId {
        &self.assignment.assignment_id
    }

    #[must_use]
    pub fn has_exact_identifier(&self) -> bool {
        self.reasons.iter().any(|reason| reason.is_exact_identifier())
    }

    #[must_use]
    pub fn has_reason(&self, reason: MatchReason) -> bool {
        self.reasons.contains(&reason)
    }

    /// The other permission's link that claims this assignment, LINKED first.
    #[must_use]
    pub fn held_elsewhere(&self) -> Option<&Link> {
        self.linked_elsewhere.as_ref().or(self.under_review_elsewhere.as_ref())
    }

    /// A candidate claimed by another permission, linked or still in review, may be reported
    /// but never auto-linked.
    #[must_use]
    pub fn eligible_for_auto_link(&self) -> bool {
        self.held_elsewhere().is_none()
    }

    fn add_reason(&mut self, reason: MatchReason) {
        if let Err(position) = self.reasons.binary_search(&reason) {
            self.reasons.insert(position, reason);
        }
    }
}

fn seed(assignment: AssignmentRecord) -> MatchCandidate {
    MatchCandidate {
        assignment,
        reasons: Vec::new(),
        distance_meters: None,
        agent_name_similarity: None,
        address_similarity: None,
        linked_elsewhere: None,
        under_review_elsewhere: None,
    }
}

fn add_candidate(
    candidates: &mut BTreeMap<AssignmentId, MatchCandidate>,
    assignment: AssignmentRecord,
    reason: MatchReason,
) {
    candidates
        .entry(assignment.assignment_id.clone())
        .or_insert_with(|| seed(assignment))
        .add_reason(reason);
}

/// Collect candidate assignments for one permission from exact identifiers and proximity.
///
/// Candidates are unioned by assignment id, so an assignment found by several lookups appears
/// once with every reason merged. No identifiers and no coordinates yields an empty list.
///
/// # Errors
/// Propagates store failures; an empty result is never an error.
pub fn generate_candidates<S: RecordStore + ?Sized>(
    store: &S,
    permission: &PermissionRecord,
    config: &ReconciliationConfig,
) -> Result<Vec<MatchCandidate>, EngineError> {
    let project_id = permission.project_id.as_str();
    let mut candidates = BTreeMap::new();

    if let Some(property_id) = permission.property_id() {
        if let Some(assignment) =
            store.assignment_by_exact_id(project_id, ExactKey::PropertyId(property_id))?
        {
            add_candidate(&mut candidates, assignment, MatchReason::PropertyIdMatch);
        }
    }

    if let Some(nad_id) = permission.one_map_nad_id() {
        if let Some(assignment) =
            store.assignment_by_exact_id(project_id, ExactKey::OneMapNadId(nad_id))?
        {
            add_candidate(&mut candidates, assignment, MatchReason::OneMapNadMatch);
        }
    }

    if let Some(point) = permission.location.point {
        for assignment in store.assignments_near(project_id, point, config.gps_proximity_meters)? {
            let within_radius = assignment
                .location
                .point
                .is_some_and(|other| point.distance_meters(&other) <= config.gps_proximity_meters);
            if within_radius {
                add_candidate(&mut candidates, assignment, MatchReason::GpsProximity);
            }
        }
    }

    let mut generated = Vec::with_capacity(candidates.len());
    for mut candidate in candidates.into_values() {
        annotate(&mut candidate, permission, config);
        candidate.linked_elsewhere = store
            .link_by_assignment_id(candidate.assignment_id())?
            .filter(|link| link.permission_id != permission.permission_id);
        if candidate.linked_elsewhere.is_none() {
            candidate.under_review_elsewhere = store
                .links_under_review_by_assignment_id(candidate.assignment_id())?
                .into_iter()
                .find(|link| link.permission_id != permission.permission_id);
        }
        generated.push(candidate);
    }
    Ok(generated)
}

fn annotate(
    candidate: &mut MatchCandidate,
    permission: &PermissionRecord,
    config: &ReconciliationConfig,
) {
    let assignment_point = candidate.assignment.location.point;
    candidate.distance_meters = match (permission.location.point, assignment_point) {
        (Some(lhs), Some(rhs)) => Some(lhs.distance_meters(&rhs)),
        _ => None,
    };

    candidate.agent_name_similarity =
        agent_name_similarity(&permission.agent.name, &candidate.assignment.agent.name);
    if candidate
        .agent_name_similarity
        .is_some_and(|similarity| similarity >= config.agent_name_similarity_threshold)
    {
        candidate.add_reason(MatchReason::AgentNameSimilar);
    }

    candidate.address_similarity =
        address_similarity(&permission.location.address, &candidate.assignment.location.address);
    if candidate
        .address_similarity
        .is_some_and(|similarity| similarity >= config.address_similarity_threshold)
    {
        candidate.add_reason(MatchReason::AddressSimilar);
    }
}
