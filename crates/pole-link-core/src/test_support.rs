use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use time::{Duration, OffsetDateTime};

use crate::candidates::MatchCandidate;
use crate::geo::GeoPoint;
use crate::model::{
    AgentInfo, AssignmentRecord, ConflictResolution, Link, LinkEvent, LinkingMethod,
    LinkingStatus, Location, MatchReason, PermissionConflict, PermissionRecord,
    ReconciliationReport, ResolutionStatus,
};
use crate::store::{ExactKey, PermissionBatch, RecordStore, RejectedRecord};
use crate::{AssignmentId, EngineError, LinkId, PermissionId};

pub(crate) const PROJECT: &str = "lawley";

pub(crate) fn ts(offset_seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_750_000_000 + offset_seconds)
}

pub(crate) fn permission(
    id: &str,
    property_id: Option<&str>,
    lat: f64,
    lon: f64,
    agent: &str,
) -> PermissionRecord {
    PermissionRecord {
        permission_id: PermissionId::from(id),
        project_id: PROJECT.to_string(),
        property_id: property_id.map(str::to_string),
        one_map_nad_id: None,
        location: Location { address: String::new(), point: Some(GeoPoint::new(lat, lon)) },
        agent: AgentInfo { name: agent.to_string(), ..AgentInfo::default() },
        created_at: ts(0),
    }
}

pub(crate) fn assignment(
    id: &str,
    property_id: Option<&str>,
    lat: f64,
    lon: f64,
    agent: &str,
) -> AssignmentRecord {
    AssignmentRecord {
        assignment_id: AssignmentId::from(id),
        project_id: PROJECT.to_string(),
        pole_number: Some(format!("LAW.P.{id}")),
        property_id: property_id.map(str::to_string),
        one_map_nad_id: None,
        location: Location { address: String::new(), point: Some(GeoPoint::new(lat, lon)) },
        agent: AgentInfo { name: agent.to_string(), ..AgentInfo::default() },
        created_at: ts(0),
    }
}

pub(crate) fn candidate(assignment: AssignmentRecord, reasons: &[MatchReason]) -> MatchCandidate {
    let mut reasons = reasons.to_vec();
    reasons.sort_unstable();
    reasons.dedup();
    MatchCandidate {
        assignment,
        reasons,
        distance_meters: None,
        agent_name_similarity: None,
        address_similarity: None,
        linked_elsewhere: None,
        under_review_elsewhere: None,
    }
}

pub(crate) fn linked_link(
    permission: &PermissionRecord,
    assignment: &AssignmentRecord,
    confidence: f64,
) -> Link {
    let mut link = Link::for_permission(permission, ts(0));
    link.attach_assignment(assignment);
    link.linking_status = LinkingStatus::Linked;
    link.linking_method = LinkingMethod::Auto;
    link.match_reasons = vec![MatchReason::PropertyIdMatch];
    link.confidence = Some(confidence);
    link.linked_at = Some(ts(0));
    link.linked_by = Some("reconciler".to_string());
    link.revision = 1;
    link
}

/// In-memory store with the same locking rules as the SQLite store, plus fault injection.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    pub permissions: Vec<PermissionRecord>,
    pub assignments: Vec<AssignmentRecord>,
    pub links: BTreeMap<PermissionId, Link>,
    pub events: Vec<LinkEvent>,
    pub conflicts: Vec<PermissionConflict>,
    pub reports: Vec<ReconciliationReport>,
    read_faults: RefCell<VecDeque<EngineError>>,
    upsert_faults: BTreeMap<PermissionId, VecDeque<EngineError>>,
    report_faults: VecDeque<EngineError>,
}

impl MemoryStore {
    pub(crate) fn add_permission(&mut self, record: PermissionRecord) {
        self.permissions.push(record);
    }

    pub(crate) fn add_assignment(&mut self, record: AssignmentRecord) {
        self.assignments.push(record);
    }

    /// Store a link as-is, bypassing locking and event logging.
    pub(crate) fn put_link(&mut self, link: Link) {
        self.links.insert(link.permission_id.clone(), link);
    }

    pub(crate) fn fail_next_reads(&mut self, count: usize, err: EngineError) {
        let mut faults = self.read_faults.borrow_mut();
        for _ in 0..count {
            faults.push_back(err.clone());
        }
    }

    pub(crate) fn fail_upserts_for(&mut self, permission_id: &str, count: usize, err: EngineError) {
        let faults = self.upsert_faults.entry(PermissionId::from(permission_id)).or_default();
        for _ in 0..count {
            faults.push_back(err.clone());
        }
    }

    pub(crate) fn fail_next_report(&mut self, err: EngineError) {
        self.report_faults.push_back(err);
    }

    pub(crate) fn link(&self, permission_id: &str) -> Option<&Link> {
        self.links.get(&PermissionId::from(permission_id))
    }

    pub(crate) fn conflicts_for(&self, permission_id: &str) -> Vec<&PermissionConflict> {
        self.conflicts
            .iter()
            .filter(|conflict| conflict.permission_id.as_str() == permission_id)
            .collect()
    }

    fn check_read(&self) -> Result<(), EngineError> {
        match self.read_faults.borrow_mut().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_unlinked(&self, permission_id: &PermissionId) -> bool {
        match self.links.get(permission_id) {
            None => true,
            Some(link) => {
                link.linking_status == LinkingStatus::PermissionOnly
                    && link.linking_method != LinkingMethod::Manual
            }
        }
    }
}

impl RecordStore for MemoryStore {
    fn unlinked_permissions(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<PermissionBatch, EngineError> {
        self.check_read()?;
        let mut pending = self
            .permissions
            .iter()
            .filter(|record| record.project_id == project_id)
            .filter(|record| self.is_unlinked(&record.permission_id))
            .collect::<Vec<_>>();
        pending.sort_by(|lhs, rhs| {
            lhs.created_at
                .cmp(&rhs.created_at)
                .then_with(|| lhs.permission_id.cmp(&rhs.permission_id))
        });

        let mut batch = PermissionBatch::default();
        for record in pending.into_iter().take(limit) {
            match record.validate() {
                Ok(()) => batch.permissions.push(record.clone()),
                Err(error) => {
                    let permission_id = Some(record.permission_id.clone());
                    batch.rejected.push(RejectedRecord { permission_id, error });
                }
            }
        }
        Ok(batch)
    }

    fn assignments_near(
        &self,
        project_id: &str,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<AssignmentRecord>, EngineError> {
        self.check_read()?;
        Ok(self
            .assignments
            .iter()
            .filter(|record| record.project_id == project_id)
            .filter(|record| {
                record
                    .location
                    .point
                    .is_some_and(|other| point.distance_meters(&other) <= radius_meters)
            })
            .cloned()
            .collect())
    }

    fn assignment_by_exact_id(
        &self,
        project_id: &str,
        key: ExactKey<'_>,
    ) -> Result<Option<AssignmentRecord>, EngineError> {
        self.check_read()?;
        Ok(self
            .assignments
            .iter()
            .filter(|record| record.project_id == project_id)
            .filter(|record| match key {
                ExactKey::PropertyId(value) => record.property_id() == Some(value),
                ExactKey::OneMapNadId(value) => record.one_map_nad_id() == Some(value),
            })
            .min_by(|lhs, rhs| {
                lhs.created_at
                    .cmp(&rhs.created_at)
                    .then_with(|| lhs.assignment_id.cmp(&rhs.assignment_id))
            })
            .cloned())
    }

    fn assignment(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<AssignmentRecord>, EngineError> {
        self.check_read()?;
        Ok(self.assignments.iter().find(|record| &record.assignment_id == assignment_id).cloned())
    }

    fn permission(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<PermissionRecord>, EngineError> {
        self.check_read()?;
        Ok(self.permissions.iter().find(|record| &record.permission_id == permission_id).cloned())
    }

    fn link_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<Link>, EngineError> {
        self.check_read()?;
        Ok(self
            .links
            .values()
            .find(|link| {
                link.linking_status == LinkingStatus::Linked
                    && link.assignment_id.as_ref() == Some(assignment_id)
            })
            .cloned())
    }

    fn links_under_review_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Vec<Link>, EngineError> {
        self.check_read()?;
        let mut held = self
            .links
            .values()
            .filter(|link| link.linking_status.needs_review())
            .filter(|link| link.assignment_id.as_ref() == Some(assignment_id))
            .cloned()
            .collect::<Vec<_>>();
        held.sort_by(|lhs, rhs| {
            lhs.created_at
                .cmp(&rhs.created_at)
                .then_with(|| lhs.permission_id.cmp(&rhs.permission_id))
        });
        Ok(held)
    }

    fn link_by_permission_id(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<Link>, EngineError> {
        self.check_read()?;
        Ok(self.links.get(permission_id).cloned())
    }

    fn upsert_link(&mut self, link: &Link, actor: &str) -> Result<Link, EngineError> {
        if let Some(faults) = self.upsert_faults.get_mut(&link.permission_id) {
            if let Some(err) = faults.pop_front() {
                return Err(err);
            }
        }
        link.validate()?;

        let existing = self.links.get(&link.permission_id);
        let stored_revision = existing.map_or(0, |current| current.revision);
        if stored_revision != link.revision {
            return Err(EngineError::StaleWrite(format!(
                "link for permission {} is at revision {stored_revision}, write expected {}",
                link.permission_id, link.revision
            )));
        }

        if link.linking_status == LinkingStatus::Linked {
            let taken = self.links.values().any(|other| {
                other.permission_id != link.permission_id
                    && other.linking_status == LinkingStatus::Linked
                    && other.assignment_id == link.assignment_id
            });
            if taken {
                return Err(EngineError::Conflict(format!(
                    "assignment {} is already linked",
                    link.assignment_id.as_ref().map_or("", AssignmentId::as_str)
                )));
            }
        }

        let from_status = existing.map(|current| current.linking_status);
        let mut stored = link.clone();
        stored.revision = link.revision + 1;
        self.events.push(LinkEvent {
            sequence: self.events.len() as u64 + 1,
            link_id: stored.link_id,
            permission_id: stored.permission_id.clone(),
            revision: stored.revision,
            from_status,
            to_status: stored.linking_status,
            assignment_id: stored.assignment_id.clone(),
            linking_method: stored.linking_method,
            confidence: stored.confidence,
            actor: actor.to_string(),
            recorded_at: stored.updated_at,
        });
        self.links.insert(stored.permission_id.clone(), stored.clone());
        Ok(stored)
    }

    fn insert_conflict(&mut self, conflict: &PermissionConflict) -> Result<(), EngineError> {
        self.conflicts.push(conflict.clone());
        Ok(())
    }

    fn resolve_conflicts(
        &mut self,
        link_id: LinkId,
        resolution: &ConflictResolution,
    ) -> Result<usize, EngineError> {
        let mut closed = 0;
        for conflict in &mut self.conflicts {
            let open = conflict.resolution.status != ResolutionStatus::Resolved;
            if conflict.link_id == link_id && open {
                conflict.resolution = resolution.clone();
                if let Some(resolved_at) = resolution.resolved_at {
                    conflict.updated_at = resolved_at;
                }
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn insert_report(&mut self, report: &ReconciliationReport) -> Result<(), EngineError> {
        if let Some(err) = self.report_faults.pop_front() {
            return Err(err);
        }
        self.reports.push(report.clone());
        Ok(())
    }

    fn linked_pole_number_collisions(&self, project_id: &str) -> Result<Vec<String>, EngineError> {
        self.check_read()?;
        let mut holders: BTreeMap<&str, BTreeSet<&AssignmentId>> = BTreeMap::new();
        for link in self.links.values() {
            if link.project_id != project_id || link.linking_status != LinkingStatus::Linked {
                continue;
            }
            if let (Some(pole), Some(assignment_id)) = (&link.pole_number, &link.assignment_id) {
                holders.entry(pole.as_str()).or_default().insert(assignment_id);
            }
        }
        Ok(holders
            .into_iter()
            .filter(|(_, assignments)| assignments.len() > 1)
            .map(|(pole, _)| pole.to_string())
            .collect())
    }
}
