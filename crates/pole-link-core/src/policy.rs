use serde::{Deserialize, Serialize};

use crate::config::ReconciliationConfig;
use crate::model::{ConflictDetails, LinkingMethod, LinkingStatus, ResolutionStatus};
use crate::scoring::ScoredCandidate;

/// Outcome of the linking policy for one permission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkDecision {
    PermissionOnly,
    Linked { method: LinkingMethod },
    Conflict { resolution: ResolutionStatus },
    DuplicatePole,
}

impl LinkDecision {
    #[must_use]
    pub fn status(self) -> LinkingStatus {
        match self {
            Self::PermissionOnly => LinkingStatus::PermissionOnly,
            Self::Linked { .. } => LinkingStatus::Linked,
            Self::Conflict { .. } => LinkingStatus::Conflict,
            Self::DuplicatePole => LinkingStatus::DuplicatePole,
        }
    }
}

/// Map the top candidate and its conflict details to exactly one outcome.
///
/// Rules, first match wins:
/// 1. no candidate: PERMISSION_ONLY
/// 2. assignment LINKED to, or under review for, another permission: DUPLICATE_POLE
/// 3. nothing flagged, confidence at or above the auto-link threshold, auto-linking enabled:
///    LINKED (GPS_MATCH when proximity dominated without an identifier, otherwise AUTO)
/// 4. any flag: CONFLICT, ESCALATED below the escalation threshold, otherwise PENDING
/// 5. confidence at or above the escalation threshold: CONFLICT, PENDING
/// 6. otherwise: PERMISSION_ONLY
#[must_use]
pub fn decide(
    top: Option<&ScoredCandidate>,
    conflicts: Option<&ConflictDetails>,
    config: &ReconciliationConfig,
) -> LinkDecision {
    let Some(top) = top else {
        return LinkDecision::PermissionOnly;
    };

    let duplicate = conflicts.is_some_and(|details| details.duplicate_pole_assignment)
        || !top.candidate.eligible_for_auto_link();
    if duplicate {
        return LinkDecision::DuplicatePole;
    }

    let flagged = conflicts.is_some_and(ConflictDetails::has_flags);
    let clears_auto_link = top.confidence >= config.auto_link_confidence_threshold;
    if !flagged && config.enable_auto_linking && clears_auto_link {
        let method = if top.gps_dominant() { LinkingMethod::GpsMatch } else { LinkingMethod::Auto };
        return LinkDecision::Linked { method };
    }

    if flagged {
        let resolution = if top.confidence < config.conflict_escalation_threshold {
            ResolutionStatus::Escalated
        } else {
            ResolutionStatus::Pending
        };
        return LinkDecision::Conflict { resolution };
    }

    if top.confidence >= config.conflict_escalation_threshold {
        return LinkDecision::Conflict { resolution: ResolutionStatus::Pending };
    }

    LinkDecision::PermissionOnly
}
