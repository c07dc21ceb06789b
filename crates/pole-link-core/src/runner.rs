use std::collections::BTreeSet;
use std::time::{Duration as StdDuration, Instant};

use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::candidates::generate_candidates;
use crate::config::ReconciliationConfig;
use crate::conflicts::{detect_conflicts, details_for_holder};
use crate::model::{
    ConflictAction, ConflictDetails, Link, LinkingMethod, LinkingStatus, PermissionConflict,
    PermissionRecord, ReconciliationReport, RecordError, ReportDetails, ResolutionStatus,
};
use crate::policy::{decide, LinkDecision};
use crate::scoring::score_and_rank;
use crate::store::{RecordStore, RetryingStore};
use crate::{AssignmentId, EngineError, PermissionId, ReportId};

/// Who runs a batch, for which project, and the timestamp stamped on everything it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub project_id: String,
    pub actor: String,
    pub as_of: OffsetDateTime,
}

impl RunContext {
    #[must_use]
    pub fn new(project_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            actor: actor.into(),
            as_of: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Unchanged,
    PermissionOnly,
    Linked(AssignmentId),
    Conflict(AssignmentId),
    Duplicate { assignment_id: AssignmentId, demoted: Option<PermissionId> },
}

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    details: ReportDetails,
    affected: BTreeSet<AssignmentId>,
    errors: Vec<RecordError>,
    timed_out: bool,
}

impl Tally {
    fn record(&mut self, permission_id: &PermissionId, outcome: Outcome) {
        match outcome {
            Outcome::Unchanged | Outcome::PermissionOnly => {}
            Outcome::Linked(assignment_id) => {
                self.details.auto_linked.push(permission_id.clone());
                self.affected.insert(assignment_id);
            }
            Outcome::Conflict(assignment_id) => {
                self.details.conflicts_found.push(permission_id.clone());
                self.affected.insert(assignment_id);
            }
            Outcome::Duplicate { assignment_id, demoted } => {
                self.details.duplicate_poles.push(permission_id.clone());
                if let Some(demoted) = demoted {
                    self.details.auto_linked.retain(|linked| linked != &demoted);
                    self.details.duplicate_poles.push(demoted);
                }
                self.affected.insert(assignment_id);
            }
        }
    }
}

/// Batch reconciliation over one project's unlinked permissions.
///
/// Permissions are processed one at a time so that every duplicate check sees the links
/// committed earlier in the same run. Per-permission failures are isolated into the report;
/// a fatal store error aborts the run and nothing is reported.
pub struct ReconciliationRunner<'s, S: RecordStore + ?Sized> {
    store: RetryingStore<'s, S>,
    config: ReconciliationConfig,
}

impl<'s, S: RecordStore + ?Sized> ReconciliationRunner<'s, S> {
    /// # Errors
    /// Returns [`EngineError::Validation`] when the config is inconsistent.
    pub fn new(store: &'s mut S, config: ReconciliationConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let limit = config.transient_retry_limit;
        Ok(Self { store: RetryingStore::new(store, limit), config })
    }

    #[must_use]
    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Reconcile up to `max_records_per_run` permissions and persist the report.
    ///
    /// # Errors
    /// Returns the run-level error (fatal store failure, or a failure to load the batch or to
    /// persist the report) with no report written.
    pub fn run(&mut self, ctx: &RunContext) -> Result<ReconciliationReport, EngineError> {
        let started = Instant::now();
        let deadline = self.config.run_timeout_ms.map(StdDuration::from_millis);
        info!(
            project_id = %ctx.project_id,
            config_version = self.config.version,
            max_records = self.config.max_records_per_run,
            "reconciliation run started"
        );

        let batch = self
            .store
            .unlinked_permissions(&ctx.project_id, self.config.max_records_per_run)
            .map_err(|err| abort(ctx, err))?;

        let mut tally = Tally::default();
        for rejected in &batch.rejected {
            warn!(
                permission_id = ?rejected.permission_id,
                error = %rejected.error,
                "permission rejected before matching"
            );
            tally
                .errors
                .push(RecordError::from_engine(rejected.permission_id.clone(), &rejected.error));
        }

        let mut input_ids = batch
            .permissions
            .iter()
            .map(|record| record.permission_id.as_str())
            .chain(batch.rejected.iter().filter_map(|rejected| {
                rejected.permission_id.as_ref().map(PermissionId::as_str)
            }))
            .collect::<Vec<_>>();
        input_ids.sort_unstable();
        let run_fingerprint = run_fingerprint(&self.config, &input_ids);

        for (index, permission) in batch.permissions.iter().enumerate() {
            if deadline.is_some_and(|limit| started.elapsed() >= limit) {
                tally.timed_out = true;
                tally.details.deferred = batch.permissions[index..]
                    .iter()
                    .map(|record| record.permission_id.clone())
                    .collect();
                warn!(
                    project_id = %ctx.project_id,
                    deferred = tally.details.deferred.len(),
                    "run timeout reached, deferring remaining permissions"
                );
                break;
            }

            tally.processed += 1;
            match self.reconcile_permission(permission, ctx) {
                Ok(outcome) => tally.record(&permission.permission_id, outcome),
                Err(err) if err.is_fatal() => return Err(abort(ctx, err)),
                Err(err) => {
                    warn!(
                        permission_id = %permission.permission_id,
                        kind = err.kind().as_str(),
                        error = %err,
                        "permission isolated after error"
                    );
                    let permission_id = Some(permission.permission_id.clone());
                    tally.errors.push(RecordError::from_engine(permission_id, &err));
                }
            }
        }

        let duplicate_pole_numbers = match self.store.linked_pole_number_collisions(&ctx.project_id)
        {
            Ok(poles) => poles,
            Err(err) if err.is_fatal() => return Err(abort(ctx, err)),
            Err(err) => {
                warn!(error = %err, "pole number collision sweep failed");
                tally.errors.push(RecordError::from_engine(None, &err));
                Vec::new()
            }
        };
        for pole in &duplicate_pole_numbers {
            warn!(
                project_id = %ctx.project_id,
                pole_number = %pole,
                "pole number linked to several assignments"
            );
        }

        let elapsed = started.elapsed();
        let mut details = tally.details;
        details.affected_assignment_ids = tally.affected.into_iter().collect();
        let report = ReconciliationReport {
            report_id: ReportId::new(),
            project_id: ctx.project_id.clone(),
            config_version: self.config.version,
            started_at: ctx.as_of,
            completed_at: ctx.as_of + Duration::try_from(elapsed).unwrap_or(Duration::ZERO),
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            permissions_processed: tally.processed,
            new_links: details.auto_linked.len(),
            conflicts: details.conflicts_found.len(),
            duplicates: details.duplicate_poles.len(),
            details,
            errors: tally.errors,
            duplicate_pole_numbers,
            timed_out: tally.timed_out,
            run_fingerprint,
        };

        self.store.insert_report(&report).map_err(|err| abort(ctx, err))?;
        info!(
            project_id = %ctx.project_id,
            report_id = %report.report_id,
            processed = report.permissions_processed,
            new_links = report.new_links,
            conflicts = report.conflicts,
            duplicates = report.duplicates,
            errors = report.errors.len(),
            timed_out = report.timed_out,
            processing_time_ms = report.processing_time_ms,
            "reconciliation run completed"
        );
        Ok(report)
    }

    fn reconcile_permission(
        &mut self,
        permission: &PermissionRecord,
        ctx: &RunContext,
    ) -> Result<Outcome, EngineError> {
        permission.validate()?;

        let existing = self.store.link_by_permission_id(&permission.permission_id)?;
        if let Some(link) = &existing {
            let reprocessable = link.linking_status == LinkingStatus::PermissionOnly
                && link.linking_method != LinkingMethod::Manual;
            if !reprocessable {
                return Ok(Outcome::Unchanged);
            }
        }

        let candidates = generate_candidates(&self.store, permission, &self.config)?;
        let ranked = score_and_rank(candidates, &self.config);
        let details = detect_conflicts(permission, &ranked, &self.config);
        let decision = decide(ranked.first(), details.as_ref(), &self.config);
        debug!(
            permission_id = %permission.permission_id,
            candidates = ranked.len(),
            confidence = ranked.first().map(|top| top.confidence),
            decision = decision.status().as_str(),
            "linking decision"
        );

        let Some(top) = ranked.into_iter().next() else {
            return self.keep_permission_only(permission, existing.is_some(), ctx);
        };

        let mut link = existing.unwrap_or_else(|| Link::for_permission(permission, ctx.as_of));
        link.attach_assignment(&top.candidate.assignment);
        link.match_reasons.clone_from(&top.candidate.reasons);
        link.confidence = Some(top.confidence);
        link.linking_status = decision.status();
        link.updated_at = ctx.as_of;
        let assignment_id = top.candidate.assignment_id().clone();

        let resolution = match decision {
            LinkDecision::PermissionOnly => {
                let had_link = link.revision > 0;
                return self.keep_permission_only(permission, had_link, ctx);
            }
            LinkDecision::Linked { method } => {
                link.linking_method = method;
                link.conflicts = None;
                link.linked_at = Some(ctx.as_of);
                link.linked_by = Some(ctx.actor.clone());
                self.store.upsert_link(&link, &ctx.actor)?;
                return Ok(Outcome::Linked(assignment_id));
            }
            LinkDecision::Conflict { resolution } => resolution,
            LinkDecision::DuplicatePole => ResolutionStatus::Pending,
        };

        link.linking_method = LinkingMethod::Auto;
        link.conflicts.clone_from(&details);
        let stored = self.store.upsert_link(&link, &ctx.actor)?;
        if let Some(details) = details.clone() {
            self.open_conflict(&stored, details, resolution)?;
        }

        if decision != LinkDecision::DuplicatePole {
            return Ok(Outcome::Conflict(assignment_id));
        }

        let split = details
            .as_ref()
            .is_some_and(|details| details.suggested_action == ConflictAction::SplitAssignment);
        let demoted = match top.candidate.linked_elsewhere {
            Some(holder) if split => {
                self.demote_holder(holder, &permission.permission_id, top.confidence, ctx)?
            }
            _ => None,
        };
        Ok(Outcome::Duplicate { assignment_id, demoted })
    }

    fn keep_permission_only(
        &mut self,
        permission: &PermissionRecord,
        has_link: bool,
        ctx: &RunContext,
    ) -> Result<Outcome, EngineError> {
        if has_link {
            return Ok(Outcome::Unchanged);
        }
        let link = Link::for_permission(permission, ctx.as_of);
        self.store.upsert_link(&link, &ctx.actor)?;
        Ok(Outcome::PermissionOnly)
    }

    // Both claims are equally strong, so the current holder joins the challenger in review.
    fn demote_holder(
        &mut self,
        holder: Link,
        challenger: &PermissionId,
        challenger_confidence: f64,
        ctx: &RunContext,
    ) -> Result<Option<PermissionId>, EngineError> {
        if holder.linking_method == LinkingMethod::Manual {
            return Ok(None);
        }
        let details = details_for_holder(
            &holder,
            challenger,
            Some(challenger_confidence),
            ConflictAction::SplitAssignment,
        );
        let mut demoted = holder;
        demoted.linking_status = LinkingStatus::DuplicatePole;
        demoted.conflicts = Some(details.clone());
        demoted.updated_at = ctx.as_of;
        let stored = self.store.upsert_link(&demoted, &ctx.actor)?;
        self.open_conflict(&stored, details, ResolutionStatus::Pending)?;
        Ok(Some(stored.permission_id))
    }

    fn open_conflict(
        &mut self,
        link: &Link,
        details: ConflictDetails,
        status: ResolutionStatus,
    ) -> Result<(), EngineError> {
        let conflict = PermissionConflict::open_for(link, details, status);
        self.store.insert_conflict(&conflict)?;
        if self.config.notify_on_conflicts {
            warn!(
                permission_id = %conflict.permission_id,
                conflict_id = %conflict.conflict_id,
                conflict_type = conflict.conflict_type.as_str(),
                suggested_action = conflict.details.suggested_action.as_str(),
                resolution = conflict.resolution.status.as_str(),
                "permission conflict requires review"
            );
        }
        Ok(())
    }
}

fn abort(ctx: &RunContext, err: EngineError) -> EngineError {
    error!(
        project_id = %ctx.project_id,
        kind = err.kind().as_str(),
        error = %err,
        "reconciliation run aborted"
    );
    err
}

fn run_fingerprint(config: &ReconciliationConfig, sorted_ids: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(config).unwrap_or_default());
    for id in sorted_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    format!("sha256:{digest:x}")
}
