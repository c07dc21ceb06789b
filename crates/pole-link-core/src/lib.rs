use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod candidates;
pub mod config;
pub mod conflicts;
pub mod geo;
pub mod manual;
pub mod model;
pub mod policy;
pub mod runner;
pub mod scoring;
pub mod similarity;
pub mod store;
pub mod summary;

#[cfg(test)]
pub(crate) mod test_support;

pub use candidates::{generate_candidates, MatchCandidate};
pub use config::ReconciliationConfig;
pub use conflicts::detect_conflicts;
pub use geo::GeoPoint;
pub use manual::{submit_manual_link, ManualLinkRequest};
pub use model::{
    AgentInfo, AssignmentRecord, ConflictAction, ConflictDetails, ConflictResolution,
    ConflictType, Link, LinkEvent, LinkingMethod, LinkingStatus, Location, MatchReason,
    PermissionConflict, PermissionRecord, ReconciliationReport, RecordError, ReportDetails,
    ResolutionStatus,
};
pub use policy::{decide, LinkDecision};
pub use runner::{ReconciliationRunner, RunContext};
pub use scoring::{rank_candidates, score_candidate, ScoredCandidate};
pub use store::{ExactKey, PermissionBatch, RecordStore, RejectedRecord};
pub use summary::{summarize, LinkingStatusSummary, StatusCounts};

/// Error taxonomy shared by every engine component and every `RecordStore` implementation.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("fatal store error: {0}")]
    FatalStore(String),
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("stale write: {0}")]
    StaleWrite(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientStore,
    FatalStore,
    Conflict,
    StaleWrite,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TransientStore => "transient_store",
            Self::FatalStore => "fatal_store",
            Self::Conflict => "conflict",
            Self::StaleWrite => "stale_write",
        }
    }
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::TransientStore(_) => ErrorKind::TransientStore,
            Self::FatalStore(_) => ErrorKind::FatalStore,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StaleWrite(_) => ErrorKind::StaleWrite,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalStore(_))
    }
}

/// Identifier of a permission record as issued by the upstream capture workflow.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PermissionId(pub String);

/// Identifier of an assignment record as issued by the construction-tracking workflow.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AssignmentId(pub String);

impl PermissionId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AssignmentId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PermissionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for AssignmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for PermissionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for AssignmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LinkId(pub Ulid);

impl LinkId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConflictId(pub Ulid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConflictId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReportId(pub Ulid);

impl ReportId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
