use crate::config::ReconciliationConfig;
use crate::model::{ConflictAction, ConflictDetails, Link, PermissionRecord};
use crate::scoring::ScoredCandidate;
use crate::similarity::agent_name_similarity;
use crate::{AssignmentId, PermissionId};

// Absorbs float noise when comparing confidences against the split margin.
const MARGIN_EPSILON: f64 = 1e-9;

fn within_margin(lhs: f64, rhs: f64, margin: f64) -> bool {
    (lhs - rhs).abs() <= margin + MARGIN_EPSILON
}

/// Inspect the top-ranked candidate for conditions that need a human.
///
/// Returns `None` only when there is no candidate at all. The flags are independent; the
/// suggested action is SPLIT_ASSIGNMENT when the assignment is already held by a permission
/// whose confidence is within `split_assignment_margin`, AUTO_LINK when nothing is flagged and
/// confidence clears the auto-link threshold, and REVIEW_MANUALLY otherwise.
#[must_use]
pub fn detect_conflicts(
    permission: &PermissionRecord,
    ranked: &[ScoredCandidate],
    config: &ReconciliationConfig,
) -> Option<ConflictDetails> {
    let top = ranked.first()?;
    let candidate = &top.candidate;

    let agent_name_mismatch = candidate.has_exact_identifier()
        && candidate
            .agent_name_similarity
            .is_some_and(|similarity| similarity < config.agent_name_similarity_threshold);
    let location_mismatch = candidate
        .distance_meters
        .is_some_and(|distance| distance > config.location_mismatch_meters);
    let holder = candidate.held_elsewhere();
    let duplicate_pole_assignment = holder.is_some();

    let competing_assignment_ids = ranked
        .iter()
        .skip(1)
        .filter(|other| other.candidate.assignment_id() != candidate.assignment_id())
        .filter(|other| other.confidence >= config.conflict_escalation_threshold)
        .filter(|other| {
            within_margin(top.confidence, other.confidence, config.split_assignment_margin)
        })
        .map(|other| other.candidate.assignment_id().clone())
        .collect::<Vec<AssignmentId>>();
    let ambiguous_match = !competing_assignment_ids.is_empty();

    let competing_permission_id = holder.map(|link| link.permission_id.clone());
    let competing_confidence = holder.and_then(|link| link.confidence);

    let mut details = ConflictDetails {
        agent_name_mismatch,
        location_mismatch,
        duplicate_pole_assignment,
        ambiguous_match,
        distance_meters: candidate.distance_meters,
        agent_name_similarity: candidate.agent_name_similarity,
        permission_agent_name: permission.agent.name.clone(),
        assignment_agent_name: Some(candidate.assignment.agent.name.clone()),
        permission_address: permission.location.address.clone(),
        assignment_address: Some(candidate.assignment.location.address.clone()),
        suggested_action: ConflictAction::ReviewManually,
        confidence: top.confidence,
        competing_assignment_ids,
        competing_permission_id,
        competing_confidence,
    };
    details.suggested_action = suggest_action(&details, config);
    Some(details)
}

fn suggest_action(details: &ConflictDetails, config: &ReconciliationConfig) -> ConflictAction {
    if details.duplicate_pole_assignment {
        let split = details.competing_confidence.is_some_and(|competing| {
            within_margin(details.confidence, competing, config.split_assignment_margin)
        });
        return if split { ConflictAction::SplitAssignment } else { ConflictAction::ReviewManually };
    }
    if !details.has_flags() && details.confidence >= config.auto_link_confidence_threshold {
        return ConflictAction::AutoLink;
    }
    ConflictAction::ReviewManually
}

/// Conflict details for the link that currently holds an assignment, seen from the side of a
/// challenger that claims the same assignment.
#[must_use]
pub fn details_for_holder(
    holder: &Link,
    challenger: &PermissionId,
    challenger_confidence: Option<f64>,
    suggested_action: ConflictAction,
) -> ConflictDetails {
    let distance_meters = match (
        holder.permission_location.point,
        holder.assignment_location.as_ref().and_then(|location| location.point),
    ) {
        (Some(lhs), Some(rhs)) => Some(lhs.distance_meters(&rhs)),
        _ => None,
    };
    let assignment_agent_name = holder.assignment_agent.as_ref().map(|agent| agent.name.clone());
    let agent_similarity = assignment_agent_name
        .as_deref()
        .and_then(|name| agent_name_similarity(&holder.permission_agent.name, name));

    ConflictDetails {
        agent_name_mismatch: false,
        location_mismatch: false,
        duplicate_pole_assignment: true,
        ambiguous_match: false,
        distance_meters,
        agent_name_similarity: agent_similarity,
        permission_agent_name: holder.permission_agent.name.clone(),
        assignment_agent_name,
        permission_address: holder.permission_location.address.clone(),
        assignment_address: holder.assignment_location.as_ref().map(|loc| loc.address.clone()),
        suggested_action,
        confidence: holder.confidence.unwrap_or(0.0),
        competing_assignment_ids: Vec::new(),
        competing_permission_id: Some(challenger.clone()),
        competing_confidence: challenger_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchReason;
    use crate::test_support::{assignment, candidate, linked_link, permission};

    fn scored(candidate: crate::candidates::MatchCandidate, confidence: f64) -> ScoredCandidate {
        ScoredCandidate {
            candidate,
            confidence,
            gps_component: 0.0,
            agent_component: 0.0,
            address_component: 0.0,
        }
    }

    #[test]
    fn no_candidates_means_no_details() {
        let record = permission("p-1", None, -26.10, 28.05, "J Smith");
        assert_eq!(detect_conflicts(&record, &[], &ReconciliationConfig::default()), None);
    }

    #[test]
    fn clean_exact_match_suggests_auto_link() {
        let record = permission("p-1", Some("P-100"), -26.10, 28.05, "J. Smith");
        let mut exact = candidate(
            assignment("a-1", Some("P-100"), -26.10, 28.05, "J Smith"),
            &[MatchReason::PropertyIdMatch],
        );
        exact.agent_name_similarity = Some(1.0);
        exact.distance_meters = Some(0.0);
        let details =
            detect_conflicts(&record, &[scored(exact, 1.0)], &ReconciliationConfig::default());
        let Some(details) = details else {
            panic!("expected details for a candidate");
        };
        assert!(!details.has_flags());
        assert_eq!(details.suggested_action, ConflictAction::AutoLink);
    }

    #[test]
    fn exact_match_with_different_agent_is_flagged() {
        let record = permission("p-1", Some("P-100"), -26.10, 28.05, "Thabo Mokoena");
        let mut exact = candidate(
            assignment("a-1", Some("P-100"), -26.10, 28.05, "Pieter van Wyk"),
            &[MatchReason::PropertyIdMatch],
        );
        exact.agent_name_similarity = Some(0.4);
        let details =
            detect_conflicts(&record, &[scored(exact, 1.0)], &ReconciliationConfig::default());
        let Some(details) = details else {
            panic!("expected details for a candidate");
        };
        assert!(details.agent_name_mismatch);
        assert_eq!(details.suggested_action, ConflictAction::ReviewManually);
    }

    #[test]
    fn distant_exact_match_is_a_location_mismatch() {
        let record = permission("p-1", Some("P-100"), -26.10, 28.05, "J Smith");
        let mut exact = candidate(
            assignment("a-1", Some("P-100"), -26.11, 28.05, "J Smith"),
            &[MatchReason::PropertyIdMatch],
        );
        exact.distance_meters = Some(1_112.0);
        exact.agent_name_similarity = Some(1.0);
        let details =
            detect_conflicts(&record, &[scored(exact, 1.0)], &ReconciliationConfig::default());
        assert!(details.is_some_and(|details| details.location_mismatch));
    }

    #[test]
    fn close_competing_claim_suggests_split() {
        let held = assignment("a-1", None, -26.10, 28.05, "J Smith");
        let holder_permission = permission("p-0", None, -26.10, 28.05, "J Smith");
        let record = permission("p-1", None, -26.10, 28.05, "J Smith");

        let mut contested = candidate(held.clone(), &[MatchReason::GpsProximity]);
        contested.linked_elsewhere = Some(linked_link(&holder_permission, &held, 0.95));

        let details =
            detect_conflicts(&record, &[scored(contested, 0.93)], &ReconciliationConfig::default());
        let Some(details) = details else {
            panic!("expected details for a candidate");
        };
        assert!(details.duplicate_pole_assignment);
        assert_eq!(details.suggested_action, ConflictAction::SplitAssignment);
        assert_eq!(details.competing_permission_id, Some(PermissionId::from("p-0")));
    }

    #[test]
    fn distant_competing_claim_needs_review() {
        let held = assignment("a-1", None, -26.10, 28.05, "J Smith");
        let holder_permission = permission("p-0", None, -26.10, 28.05, "J Smith");
        let record = permission("p-1", None, -26.10, 28.05, "J Smith");

        let mut contested = candidate(held.clone(), &[MatchReason::GpsProximity]);
        contested.linked_elsewhere = Some(linked_link(&holder_permission, &held, 1.0));

        let details =
            detect_conflicts(&record, &[scored(contested, 0.7)], &ReconciliationConfig::default());
        assert_eq!(
            details.map(|details| details.suggested_action),
            Some(ConflictAction::ReviewManually)
        );
    }

    #[test]
    fn near_equal_runner_up_marks_ambiguous_match() {
        let record = permission("p-1", None, -26.10, 28.05, "J Smith");
        let first = candidate(
            assignment("a-1", None, -26.10, 28.05, "J Smith"),
            &[MatchReason::GpsProximity],
        );
        let second = candidate(
            assignment("a-2", None, -26.10, 28.05, "J Smith"),
            &[MatchReason::GpsProximity],
        );
        let third = candidate(
            assignment("a-3", None, -26.10, 28.05, "J Smith"),
            &[MatchReason::GpsProximity],
        );
        let ranked = [scored(first, 0.95), scored(second, 0.92), scored(third, 0.5)];
        let details = detect_conflicts(&record, &ranked, &ReconciliationConfig::default());
        let Some(details) = details else {
            panic!("expected details for a candidate");
        };
        assert!(details.ambiguous_match);
        assert_eq!(details.competing_assignment_ids, vec![AssignmentId::from("a-2")]);
        assert_eq!(details.suggested_action, ConflictAction::ReviewManually);
    }

    #[test]
    fn holder_details_point_back_at_challenger() {
        let held = assignment("a-1", None, -26.10, 28.05, "J Smith");
        let holder = linked_link(&permission("p-0", None, -26.10, 28.05, "J Smith"), &held, 1.0);
        let details = details_for_holder(
            &holder,
            &PermissionId::from("p-1"),
            Some(1.0),
            ConflictAction::SplitAssignment,
        );
        assert!(details.duplicate_pole_assignment);
        assert_eq!(details.competing_permission_id, Some(PermissionId::from("p-1")));
        assert_eq!(details.agent_name_similarity, Some(1.0));
        assert!(details.distance_meters.is_some_and(|distance| distance < 1.0));
    }
}
