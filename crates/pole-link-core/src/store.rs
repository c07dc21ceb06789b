use tracing::debug;

use crate::geo::GeoPoint;
use crate::model::{
    AssignmentRecord, ConflictResolution, Link, PermissionConflict, PermissionRecord,
    ReconciliationReport,
};
use crate::{AssignmentId, EngineError, LinkId, PermissionId};

/// Exact identifier shared by a permission and an assignment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExactKey<'a> {
    PropertyId(&'a str),
    OneMapNadId(&'a str),
}

/// A stored permission that failed validation and never reaches matching.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RejectedRecord {
    pub permission_id: Option<PermissionId>,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionBatch {
    pub permissions: Vec<PermissionRecord>,
    pub rejected: Vec<RejectedRecord>,
}

/// Record store seen by the engine.
///
/// Every call may fail with [`EngineError::TransientStore`] (worth retrying) or
/// [`EngineError::FatalStore`] (abort the run). `upsert_link` is the only link writer and
/// enforces optimistic locking on `Link::revision`.
pub trait RecordStore {
    /// Permissions with no link yet, or with an engine-created PERMISSION_ONLY link, oldest
    /// first. Stored rows that fail validation come back in `rejected`.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    fn unlinked_permissions(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<PermissionBatch, EngineError>;

    /// Assignments within `radius_meters` great-circle distance of `point`.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    fn assignments_near(
        &self,
        project_id: &str,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<AssignmentRecord>, EngineError>;

    /// Earliest assignment carrying the identifier.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    fn assignment_by_exact_id(
        &self,
        project_id: &str,
        key: ExactKey<'_>,
    ) -> Result<Option<AssignmentRecord>, EngineError>;

    /// # Errors
    /// Returns a store error when the read fails.
    fn assignment(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<AssignmentRecord>, EngineError>;

    /// # Errors
    /// Returns a store error when the read fails.
    fn permission(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<PermissionRecord>, EngineError>;

    /// The LINKED link holding this assignment, if any.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    fn link_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<Link>, EngineError>;

    /// CONFLICT and DUPLICATE_POLE links carrying this assignment, oldest first.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    fn links_under_review_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Vec<Link>, EngineError>;

    /// # Errors
    /// Returns a store error when the read fails.
    fn link_by_permission_id(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<Link>, EngineError>;

    /// Insert (`revision == 0`) or compare-and-swap update of the link keyed by permission,
    /// appending one link event. Returns the stored link with its new revision.
    ///
    /// # Errors
    /// Returns [`EngineError::StaleWrite`] when the stored revision differs from
    /// `link.revision`, [`EngineError::Conflict`] when a second LINKED link would hold the same
    /// assignment, or a store error when the write fails.
    fn upsert_link(&mut self, link: &Link, actor: &str) -> Result<Link, EngineError>;

    /// # Errors
    /// Returns a store error when the write fails.
    fn insert_conflict(&mut self, conflict: &PermissionConflict) -> Result<(), EngineError>;

    /// Apply `resolution` to every open conflict of the link. Returns how many were closed.
    ///
    /// # Errors
    /// Returns a store error when the write fails.
    fn resolve_conflicts(
        &mut self,
        link_id: LinkId,
        resolution: &ConflictResolution,
    ) -> Result<usize, EngineError>;

    /// # Errors
    /// Returns a store error when the write fails.
    fn insert_report(&mut self, report: &ReconciliationReport) -> Result<(), EngineError>;

    /// Pole numbers carried by LINKED links on more than one distinct assignment.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    fn linked_pole_number_collisions(&self, project_id: &str) -> Result<Vec<String>, EngineError>;
}

/// Run `op`, retrying transient failures up to `limit` extra times.
///
/// # Errors
/// Returns the first non-transient error, or the last transient error once retries run out.
pub fn with_retry<T>(
    limit: u32,
    mut op: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let mut attempt = 0_u32;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempt < limit => {
                attempt += 1;
                debug!(attempt, limit, error = %err, "retrying transient store failure");
            }
            result => return result,
        }
    }
}

/// Store view that retries each individual call on transient failure.
pub(crate) struct RetryingStore<'s, S: RecordStore + ?Sized> {
    inner: &'s mut S,
    limit: u32,
}

impl<'s, S: RecordStore + ?Sized> RetryingStore<'s, S> {
    pub(crate) fn new(inner: &'s mut S, limit: u32) -> Self {
        Self { inner, limit }
    }
}

impl<S: RecordStore + ?Sized> RecordStore for RetryingStore<'_, S> {
    fn unlinked_permissions(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<PermissionBatch, EngineError> {
        with_retry(self.limit, || self.inner.unlinked_permissions(project_id, limit))
    }

    fn assignments_near(
        &self,
        project_id: &str,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<AssignmentRecord>, EngineError> {
        with_retry(self.limit, || self.inner.assignments_near(project_id, point, radius_meters))
    }

    fn assignment_by_exact_id(
        &self,
        project_id: &str,
        key: ExactKey<'_>,
    ) -> Result<Option<AssignmentRecord>, EngineError> {
        with_retry(self.limit, || self.inner.assignment_by_exact_id(project_id, key))
    }

    fn assignment(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<AssignmentRecord>, EngineError> {
        with_retry(self.limit, || self.inner.assignment(assignment_id))
    }

    fn permission(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<PermissionRecord>, EngineError> {
        with_retry(self.limit, || self.inner.permission(permission_id))
    }

    fn link_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<Link>, EngineError> {
        with_retry(self.limit, || self.inner.link_by_assignment_id(assignment_id))
    }

    fn links_under_review_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Vec<Link>, EngineError> {
        with_retry(self.limit, || self.inner.links_under_review_by_assignment_id(assignment_id))
    }

    fn link_by_permission_id(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<Link>, EngineError> {
        with_retry(self.limit, || self.inner.link_by_permission_id(permission_id))
    }

    fn upsert_link(&mut self, link: &Link, actor: &str) -> Result<Link, EngineError> {
        let limit = self.limit;
        with_retry(limit, || self.inner.upsert_link(link, actor))
    }

    fn insert_conflict(&mut self, conflict: &PermissionConflict) -> Result<(), EngineError> {
        let limit = self.limit;
        with_retry(limit, || self.inner.insert_conflict(conflict))
    }

    fn resolve_conflicts(
        &mut self,
        link_id: LinkId,
        resolution: &ConflictResolution,
    ) -> Result<usize, EngineError> {
        let limit = self.limit;
        with_retry(limit, || self.inner.resolve_conflicts(link_id, resolution))
    }

    fn insert_report(&mut self, report: &ReconciliationReport) -> Result<(), EngineError> {
        let limit = self.limit;
        with_retry(limit, || self.inner.insert_report(report))
    }

    fn linked_pole_number_collisions(&self, project_id: &str) -> Result<Vec<String>, EngineError> {
        with_retry(self.limit, || self.inner.linked_pole_number_collisions(project_id))
    }
}
