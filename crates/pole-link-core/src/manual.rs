use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::conflicts::details_for_holder;
use crate::model::{
    ConflictAction, ConflictResolution, Link, LinkingMethod, LinkingStatus, PermissionConflict,
    ResolutionStatus,
};
use crate::store::RecordStore;
use crate::{AssignmentId, EngineError, PermissionId};

/// A reviewer's confirmation of how one permission should be linked.
///
/// Without `assignment_id` the request confirms that the permission has no assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualLinkRequest {
    pub permission_id: PermissionId,
    #[serde(default)]
    pub assignment_id: Option<AssignmentId>,
    pub confirmed_by: String,
    #[serde(default)]
    pub override_conflicts: bool,
    /// `updated_at` of the link the reviewer looked at; the write fails if it has moved on.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expected_updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ManualLinkRequest {
    /// # Errors
    /// Returns [`EngineError::Validation`] when an identifier or the confirming user is blank.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.permission_id.as_str().trim().is_empty() {
            return Err(EngineError::Validation("permission_id MUST be non-empty".to_string()));
        }
        if self.assignment_id.as_ref().is_some_and(|id| id.as_str().trim().is_empty()) {
            return Err(EngineError::Validation(
                "assignment_id MUST be non-empty when present".to_string(),
            ));
        }
        if self.confirmed_by.trim().is_empty() {
            return Err(EngineError::Validation("confirmed_by MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

/// Apply a reviewer's decision to a permission's link.
///
/// The link ends LINKED (or PERMISSION_ONLY when no assignment is given) with method MANUAL, and
/// every open conflict on it is resolved by the confirming user. An assignment already LINKED
/// to another permission is only taken over with `override_conflicts`; the previous holder is
/// then moved to CONFLICT with a pending review of its own.
///
/// # Errors
/// - [`EngineError::Validation`] for a malformed request or unknown records.
/// - [`EngineError::StaleWrite`] when the link changed since `expected_updated_at`.
/// - [`EngineError::Conflict`] when the assignment is held elsewhere and no override was asked.
/// - Store errors from the underlying [`RecordStore`].
pub fn submit_manual_link<S: RecordStore + ?Sized>(
    store: &mut S,
    request: &ManualLinkRequest,
    now: OffsetDateTime,
) -> Result<Link, EngineError> {
    request.validate()?;
    let actor = request.confirmed_by.trim();

    let Some(permission) = store.permission(&request.permission_id)? else {
        return Err(EngineError::Validation(format!(
            "permission {} does not exist",
            request.permission_id
        )));
    };

    let existing = store.link_by_permission_id(&request.permission_id)?;
    if let Some(expected) = request.expected_updated_at {
        let current = existing.as_ref().map(|link| link.updated_at);
        if current != Some(expected) {
            return Err(EngineError::StaleWrite(format!(
                "link for permission {} changed since the request was prepared",
                request.permission_id
            )));
        }
    }

    let mut link = existing.unwrap_or_else(|| Link::for_permission(&permission, now));
    match &request.assignment_id {
        Some(assignment_id) => {
            let Some(assignment) = store.assignment(assignment_id)? else {
                return Err(EngineError::Validation(format!(
                    "assignment {assignment_id} does not exist"
                )));
            };
            if assignment.project_id != permission.project_id {
                return Err(EngineError::Validation(format!(
                    "assignment {assignment_id} belongs to project {}, not {}",
                    assignment.project_id, permission.project_id
                )));
            }

            let holder = store
                .link_by_assignment_id(assignment_id)?
                .filter(|holder| holder.permission_id != request.permission_id);
            if let Some(holder) = holder {
                if !request.override_conflicts {
                    warn!(
                        permission_id = %request.permission_id,
                        assignment_id = %assignment_id,
                        holder = %holder.permission_id,
                        "manual link rejected, assignment already linked"
                    );
                    return Err(EngineError::Conflict(format!(
                        "assignment {assignment_id} is already linked to permission {}",
                        holder.permission_id
                    )));
                }
                displace_holder(store, holder, &request.permission_id, actor, now)?;
            }

            if link.assignment_id.as_ref() != Some(assignment_id) {
                link.match_reasons.clear();
            }
            link.attach_assignment(&assignment);
            link.linking_status = LinkingStatus::Linked;
            link.confidence = Some(1.0);
        }
        None => {
            link.detach_assignment();
            link.linking_status = LinkingStatus::PermissionOnly;
        }
    }

    link.linking_method = LinkingMethod::Manual;
    link.conflicts = None;
    link.linked_at = Some(now);
    link.linked_by = Some(actor.to_string());
    link.updated_at = now;

    let stored = store.upsert_link(&link, actor)?;
    let resolved = store.resolve_conflicts(
        stored.link_id,
        &ConflictResolution::resolved(actor, now, request.notes.clone()),
    )?;
    info!(
        permission_id = %stored.permission_id,
        assignment_id = ?stored.assignment_id.as_ref().map(AssignmentId::as_str),
        status = stored.linking_status.as_str(),
        confirmed_by = actor,
        resolved_conflicts = resolved,
        "manual link committed"
    );
    Ok(stored)
}

fn displace_holder<S: RecordStore + ?Sized>(
    store: &mut S,
    holder: Link,
    challenger: &PermissionId,
    actor: &str,
    now: OffsetDateTime,
) -> Result<(), EngineError> {
    let details = details_for_holder(&holder, challenger, None, ConflictAction::ReviewManually);
    let mut displaced = holder;
    displaced.linking_status = LinkingStatus::Conflict;
    displaced.conflicts = Some(details.clone());
    displaced.updated_at = now;
    let stored = store.upsert_link(&displaced, actor)?;
    store.insert_conflict(&PermissionConflict::open_for(
        &stored,
        details,
        ResolutionStatus::Pending,
    ))?;
    warn!(
        permission_id = %stored.permission_id,
        displaced_by = %challenger,
        "linked permission displaced by manual override"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictDetails, ConflictType};
    use crate::test_support::{assignment, linked_link, permission, ts, MemoryStore};

    fn request(permission_id: &str, assignment_id: Option<&str>) -> ManualLinkRequest {
        ManualLinkRequest {
            permission_id: PermissionId::from(permission_id),
            assignment_id: assignment_id.map(AssignmentId::from),
            confirmed_by: "field.supervisor".to_string(),
            override_conflicts: false,
            expected_updated_at: None,
            notes: None,
        }
    }

    fn seeded() -> MemoryStore {
        let mut store = MemoryStore::default();
        store.add_permission(permission("p-1", None, -26.10, 28.05, "J Smith"));
        store.add_permission(permission("p-2", None, -26.10, 28.05, "J Smith"));
        store.add_assignment(assignment("a-1", None, -26.10, 28.05, "J Smith"));
        store
    }

    #[test]
    fn links_permission_manually_and_resolves_open_conflicts() {
        let mut store = seeded();
        let p1 = permission("p-1", None, -26.10, 28.05, "J Smith");
        let mut conflicted = Link::for_permission(&p1, ts(0));
        conflicted.linking_status = LinkingStatus::Conflict;
        conflicted.revision = 1;
        let details = ConflictDetails { location_mismatch: true, ..ConflictDetails::default() };
        store.conflicts.push(PermissionConflict::open_for(
            &conflicted,
            details,
            ResolutionStatus::Pending,
        ));
        store.put_link(conflicted);

        let mut submitted = request("p-1", Some("a-1"));
        submitted.notes = Some("checked on site".to_string());
        let link = match submit_manual_link(&mut store, &submitted, ts(60)) {
            Ok(link) => link,
            Err(err) => panic!("manual link should succeed: {err}"),
        };

        assert_eq!(link.linking_status, LinkingStatus::Linked);
        assert_eq!(link.linking_method, LinkingMethod::Manual);
        assert_eq!(link.linked_by.as_deref(), Some("field.supervisor"));
        assert_eq!(link.linked_at, Some(ts(60)));
        assert_eq!(link.revision, 2);
        let conflicts = store.conflicts_for("p-1");
        assert_eq!(conflicts[0].resolution.status, ResolutionStatus::Resolved);
        assert_eq!(conflicts[0].resolution.resolved_by.as_deref(), Some("field.supervisor"));
        assert_eq!(conflicts[0].resolution.notes.as_deref(), Some("checked on site"));
    }

    #[test]
    fn confirms_permission_only_without_assignment() {
        let mut store = seeded();
        let link = match submit_manual_link(&mut store, &request("p-1", None), ts(60)) {
            Ok(link) => link,
            Err(err) => panic!("confirmation should succeed: {err}"),
        };
        assert_eq!(link.linking_status, LinkingStatus::PermissionOnly);
        assert_eq!(link.linking_method, LinkingMethod::Manual);
        assert_eq!(link.assignment_id, None);
    }

    #[test]
    fn rejects_assignment_linked_elsewhere_without_override() {
        let mut store = seeded();
        let holder = linked_link(
            &permission("p-2", None, -26.10, 28.05, "J Smith"),
            &assignment("a-1", None, -26.10, 28.05, "J Smith"),
            0.95,
        );
        store.put_link(holder);

        let result = submit_manual_link(&mut store, &request("p-1", Some("a-1")), ts(60));

        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert_eq!(store.link("p-2").map(|link| link.linking_status), Some(LinkingStatus::Linked));
        assert!(store.link("p-1").is_none());
    }

    #[test]
    fn override_moves_previous_holder_to_conflict() {
        let mut store = seeded();
        let holder = linked_link(
            &permission("p-2", None, -26.10, 28.05, "J Smith"),
            &assignment("a-1", None, -26.10, 28.05, "J Smith"),
            0.95,
        );
        store.put_link(holder);

        let mut submitted = request("p-1", Some("a-1"));
        submitted.override_conflicts = true;
        let link = match submit_manual_link(&mut store, &submitted, ts(60)) {
            Ok(link) => link,
            Err(err) => panic!("override should succeed: {err}"),
        };

        assert_eq!(link.linking_status, LinkingStatus::Linked);
        let Some(displaced) = store.link("p-2") else {
            panic!("holder link should remain");
        };
        assert_eq!(displaced.linking_status, LinkingStatus::Conflict);
        assert_eq!(displaced.linked_at, Some(ts(0)));
        let conflicts = store.conflicts_for("p-2");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::DuplicatePole);
        assert_eq!(conflicts[0].details.competing_permission_id, Some(PermissionId::from("p-1")));
        assert_eq!(conflicts[0].resolution.status, ResolutionStatus::Pending);
    }

    #[test]
    fn stale_expected_timestamp_is_rejected() {
        let mut store = seeded();
        let p1 = permission("p-1", None, -26.10, 28.05, "J Smith");
        let mut current = Link::for_permission(&p1, ts(0));
        current.revision = 1;
        current.updated_at = ts(30);
        store.put_link(current);

        let mut submitted = request("p-1", Some("a-1"));
        submitted.expected_updated_at = Some(ts(0));
        let result = submit_manual_link(&mut store, &submitted, ts(60));

        assert!(matches!(result, Err(EngineError::StaleWrite(_))));

        submitted.expected_updated_at = Some(ts(30));
        assert!(submit_manual_link(&mut store, &submitted, ts(60)).is_ok());
    }

    #[test]
    fn unknown_records_and_blank_reviewer_are_validation_errors() {
        let mut store = seeded();
        let missing = submit_manual_link(&mut store, &request("p-404", None), ts(60));
        assert!(matches!(missing, Err(EngineError::Validation(_))));

        let unknown = submit_manual_link(&mut store, &request("p-1", Some("a-404")), ts(60));
        assert!(matches!(unknown, Err(EngineError::Validation(_))));

        let mut blank = request("p-1", None);
        blank.confirmed_by = "  ".to_string();
        let blank = submit_manual_link(&mut store, &blank, ts(60));
        assert!(matches!(blank, Err(EngineError::Validation(_))));
    }

    #[test]
    fn request_parses_from_json_with_defaults() {
        let parsed: ManualLinkRequest = match serde_json::from_str(
            r#"{"permission_id":"p-1","assignment_id":"a-1","confirmed_by":"reviewer"}"#,
        ) {
            Ok(parsed) => parsed,
            Err(err) => panic!("request should parse: {err}"),
        };
        assert!(!parsed.override_conflicts);
        assert_eq!(parsed.expected_updated_at, None);
        assert_eq!(parsed.assignment_id, Some(AssignmentId::from("a-1")));
    }
}
