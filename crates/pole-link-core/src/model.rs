use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::geo::GeoPoint;
use crate::{AssignmentId, ConflictId, EngineError, ErrorKind, LinkId, PermissionId, ReportId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkingStatus {
    PermissionOnly,
    Linked,
    Conflict,
    DuplicatePole,
}

impl LinkingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionOnly => "permission_only",
            Self::Linked => "linked",
            Self::Conflict => "conflict",
            Self::DuplicatePole => "duplicate_pole",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "permission_only" => Some(Self::PermissionOnly),
            "linked" => Some(Self::Linked),
            "conflict" => Some(Self::Conflict),
            "duplicate_pole" => Some(Self::DuplicatePole),
            _ => None,
        }
    }

    /// Statuses that open a `PermissionConflict` when entered.
    #[must_use]
    pub fn needs_review(self) -> bool {
        matches!(self, Self::Conflict | Self::DuplicatePole)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkingMethod {
    Auto,
    Manual,
    GpsMatch,
}

impl LinkingMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::GpsMatch => "gps_match",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "gps_match" => Some(Self::GpsMatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    PropertyIdMatch,
    OneMapNadMatch,
    GpsProximity,
    AgentNameSimilar,
    AddressSimilar,
}

impl MatchReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PropertyIdMatch => "property_id_match",
            Self::OneMapNadMatch => "one_map_nad_match",
            Self::GpsProximity => "gps_proximity",
            Self::AgentNameSimilar => "agent_name_similar",
            Self::AddressSimilar => "address_similar",
        }
    }

    #[must_use]
    pub fn is_exact_identifier(self) -> bool {
        matches!(self, Self::PropertyIdMatch | Self::OneMapNadMatch)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    AutoLink,
    #[default]
    ReviewManually,
    SplitAssignment,
}

impl ConflictAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoLink => "auto_link",
            Self::ReviewManually => "review_manually",
            Self::SplitAssignment => "split_assignment",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    AgentMismatch,
    LocationMismatch,
    DuplicatePole,
    MultipleMatches,
    LowConfidence,
}

impl ConflictType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentMismatch => "agent_mismatch",
            Self::LocationMismatch => "location_mismatch",
            Self::DuplicatePole => "duplicate_pole",
            Self::MultipleMatches => "multiple_matches",
            Self::LowConfidence => "low_confidence",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent_mismatch" => Some(Self::AgentMismatch),
            "location_mismatch" => Some(Self::LocationMismatch),
            "duplicate_pole" => Some(Self::DuplicatePole),
            "multiple_matches" => Some(Self::MultipleMatches),
            "low_confidence" => Some(Self::LowConfidence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    Resolved,
    Escalated,
}

impl ResolutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Location {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub point: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub payment_eligible: bool,
}

/// Consent captured in the field. Never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRecord {
    pub permission_id: PermissionId,
    pub project_id: String,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub one_map_nad_id: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub agent: AgentInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Pole number assignment made during construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRecord {
    pub assignment_id: AssignmentId,
    pub project_id: String,
    #[serde(default)]
    pub pole_number: Option<String>,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub one_map_nad_id: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub agent: AgentInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Trimmed value of an optional identifier, treating blank strings as absent.
#[must_use]
pub fn present(value: Option<&String>) -> Option<&str> {
    value.map(|raw| raw.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn require_non_empty(value: &str, field: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}

impl PermissionRecord {
    #[must_use]
    pub fn property_id(&self) -> Option<&str> {
        present(self.property_id.as_ref())
    }

    #[must_use]
    pub fn one_map_nad_id(&self) -> Option<&str> {
        present(self.one_map_nad_id.as_ref())
    }

    /// Validate a permission record before it reaches matching.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for blank identity fields, a blank agent name, or
    /// coordinates outside WGS84 bounds.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_empty(self.permission_id.as_str(), "permission_id")?;
        require_non_empty(&self.project_id, "project_id")?;
        require_non_empty(&self.agent.name, "agent.name")?;
        if let Some(point) = &self.location.point {
            point.validate()?;
        }
        Ok(())
    }
}

impl AssignmentRecord {
    #[must_use]
    pub fn property_id(&self) -> Option<&str> {
        present(self.property_id.as_ref())
    }

    #[must_use]
    pub fn one_map_nad_id(&self) -> Option<&str> {
        present(self.one_map_nad_id.as_ref())
    }

    #[must_use]
    pub fn pole_number(&self) -> Option<&str> {
        present(self.pole_number.as_ref())
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] for blank identity fields or invalid coordinates.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_empty(self.assignment_id.as_str(), "assignment_id")?;
        require_non_empty(&self.project_id, "project_id")?;
        if let Some(point) = &self.location.point {
            point.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConflictDetails {
    pub agent_name_mismatch: bool,
    pub location_mismatch: bool,
    pub duplicate_pole_assignment: bool,
    #[serde(default)]
    pub ambiguous_match: bool,
    pub distance_meters: Option<f64>,
    pub agent_name_similarity: Option<f64>,
    pub permission_agent_name: String,
    pub assignment_agent_name: Option<String>,
    pub permission_address: String,
    pub assignment_address: Option<String>,
    pub suggested_action: ConflictAction,
    pub confidence: f64,
    #[serde(default)]
    pub competing_assignment_ids: Vec<AssignmentId>,
    #[serde(default)]
    pub competing_permission_id: Option<PermissionId>,
    #[serde(default)]
    pub competing_confidence: Option<f64>,
}

impl ConflictDetails {
    #[must_use]
    pub fn has_flags(&self) -> bool {
        self.agent_name_mismatch
            || self.location_mismatch
            || self.duplicate_pole_assignment
            || self.ambiguous_match
    }

    /// Most severe conflict category carried by these details.
    #[must_use]
    pub fn conflict_type(&self) -> ConflictType {
        if self.duplicate_pole_assignment {
            ConflictType::DuplicatePole
        } else if self.ambiguous_match {
            ConflictType::MultipleMatches
        } else if self.location_mismatch {
            ConflictType::LocationMismatch
        } else if self.agent_name_mismatch {
            ConflictType::AgentMismatch
        } else {
            ConflictType::LowConfidence
        }
    }
}

/// Relationship between one permission and at most one assignment.
///
/// `revision` is the optimistic-lock counter: 0 for a link that has never been stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub link_id: LinkId,
    pub project_id: String,
    pub permission_id: PermissionId,
    pub assignment_id: Option<AssignmentId>,
    pub property_id: Option<String>,
    pub one_map_nad_id: Option<String>,
    pub pole_number: Option<String>,
    pub permission_location: Location,
    pub assignment_location: Option<Location>,
    pub permission_agent: AgentInfo,
    pub assignment_agent: Option<AgentInfo>,
    pub linking_status: LinkingStatus,
    pub linking_method: LinkingMethod,
    pub conflicts: Option<ConflictDetails>,
    #[serde(default)]
    pub match_reasons: Vec<MatchReason>,
    pub confidence: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub linked_at: Option<OffsetDateTime>,
    pub linked_by: Option<String>,
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Link {
    /// Fresh PERMISSION_ONLY link carrying the permission-side snapshots.
    #[must_use]
    pub fn for_permission(permission: &PermissionRecord, now: OffsetDateTime) -> Self {
        Self {
            link_id: LinkId::new(),
            project_id: permission.project_id.clone(),
            permission_id: permission.permission_id.clone(),
            assignment_id: None,
            property_id: permission.property_id().map(str::to_string),
            one_map_nad_id: permission.one_map_nad_id().map(str::to_string),
            pole_number: None,
            permission_location: permission.location.clone(),
            assignment_location: None,
            permission_agent: permission.agent.clone(),
            assignment_agent: None,
            linking_status: LinkingStatus::PermissionOnly,
            linking_method: LinkingMethod::Auto,
            conflicts: None,
            match_reasons: Vec::new(),
            confidence: None,
            linked_at: None,
            linked_by: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy the assignment-side identity and snapshots onto this link.
    pub fn attach_assignment(&mut self, assignment: &AssignmentRecord) {
        self.assignment_id = Some(assignment.assignment_id.clone());
        self.pole_number = assignment.pole_number().map(str::to_string);
        self.assignment_location = Some(assignment.location.clone());
        self.assignment_agent = Some(assignment.agent.clone());
        if self.property_id.is_none() {
            self.property_id = assignment.property_id().map(str::to_string);
        }
        if self.one_map_nad_id.is_none() {
            self.one_map_nad_id = assignment.one_map_nad_id().map(str::to_string);
        }
    }

    /// Drop the assignment side, returning the link to a permission-only shape.
    pub fn detach_assignment(&mut self) {
        self.assignment_id = None;
        self.pole_number = None;
        self.assignment_location = None;
        self.assignment_agent = None;
        self.match_reasons.clear();
        self.confidence = None;
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when a LINKED, CONFLICT or DUPLICATE_POLE link has no
    /// assignment, or when confidence leaves [0, 1].
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_empty(self.permission_id.as_str(), "permission_id")?;
        require_non_empty(&self.project_id, "project_id")?;
        if self.linking_status == LinkingStatus::Linked && self.assignment_id.is_none() {
            return Err(EngineError::Validation(
                "assignment_id MUST be set when linking_status is linked".to_string(),
            ));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(EngineError::Validation(
                    "confidence MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One committed transition of a link, in commit order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkEvent {
    pub sequence: u64,
    pub link_id: LinkId,
    pub permission_id: PermissionId,
    pub revision: u64,
    pub from_status: Option<LinkingStatus>,
    pub to_status: LinkingStatus,
    pub assignment_id: Option<AssignmentId>,
    pub linking_method: LinkingMethod,
    pub confidence: Option<f64>,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictResolution {
    pub status: ResolutionStatus,
    pub resolved_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

impl ConflictResolution {
    #[must_use]
    pub fn open(status: ResolutionStatus) -> Self {
        Self { status, resolved_by: None, resolved_at: None, notes: None }
    }

    #[must_use]
    pub fn resolved(by: &str, at: OffsetDateTime, notes: Option<String>) -> Self {
        Self {
            status: ResolutionStatus::Resolved,
            resolved_by: Some(by.to_string()),
            resolved_at: Some(at),
            notes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionConflict {
    pub conflict_id: ConflictId,
    pub link_id: LinkId,
    pub permission_id: PermissionId,
    pub project_id: String,
    pub conflict_type: ConflictType,
    pub details: ConflictDetails,
    pub resolution: ConflictResolution,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PermissionConflict {
    #[must_use]
    pub fn open_for(link: &Link, details: ConflictDetails, status: ResolutionStatus) -> Self {
        Self {
            conflict_id: ConflictId::new(),
            link_id: link.link_id,
            permission_id: link.permission_id.clone(),
            project_id: link.project_id.clone(),
            conflict_type: details.conflict_type(),
            details,
            resolution: ConflictResolution::open(status),
            created_at: link.updated_at,
            updated_at: link.updated_at,
        }
    }
}

/// Per-permission failure isolated by a run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordError {
    pub permission_id: Option<PermissionId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    #[must_use]
    pub fn from_engine(permission_id: Option<PermissionId>, err: &EngineError) -> Self {
        Self { permission_id, kind: err.kind(), message: err.to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportDetails {
    pub auto_linked: Vec<PermissionId>,
    pub conflicts_found: Vec<PermissionId>,
    pub duplicate_poles: Vec<PermissionId>,
    pub affected_assignment_ids: Vec<AssignmentId>,
    pub deferred: Vec<PermissionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationReport {
    pub report_id: ReportId,
    pub project_id: String,
    pub config_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub processing_time_ms: u64,
    pub permissions_processed: usize,
    pub new_links: usize,
    pub conflicts: usize,
    pub duplicates: usize,
    pub details: ReportDetails,
    pub errors: Vec<RecordError>,
    pub duplicate_pole_numbers: Vec<String>,
    pub timed_out: bool,
    pub run_fingerprint: String,
}
