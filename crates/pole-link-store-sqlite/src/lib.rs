use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pole_link_core::{
    AssignmentId, AssignmentRecord, ConflictResolution, EngineError, ErrorKind, ExactKey, GeoPoint,
    Link, LinkEvent, LinkId, LinkingMethod, LinkingStatus, PermissionBatch, PermissionConflict,
    PermissionId, PermissionRecord, ReconciliationConfig, ReconciliationReport, RecordStore,
    RejectedRecord, StatusCounts,
};
use rusqlite::{
    ffi, params, Connection, DatabaseName, ErrorCode, OptionalExtension, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS permissions (
  permission_id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  property_id TEXT,
  one_map_nad_id TEXT,
  latitude REAL,
  longitude REAL,
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  record_json TEXT NOT NULL,
  CHECK ((latitude IS NULL) = (longitude IS NULL))
);

CREATE TABLE IF NOT EXISTS assignments (
  assignment_id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  pole_number TEXT,
  property_id TEXT,
  one_map_nad_id TEXT,
  latitude REAL,
  longitude REAL,
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  record_json TEXT NOT NULL,
  CHECK ((latitude IS NULL) = (longitude IS NULL))
);

CREATE TABLE IF NOT EXISTS permission_links (
  link_id TEXT PRIMARY KEY,
  permission_id TEXT NOT NULL UNIQUE REFERENCES permissions(permission_id),
  project_id TEXT NOT NULL,
  assignment_id TEXT REFERENCES assignments(assignment_id),
  pole_number TEXT,
  linking_status TEXT NOT NULL CHECK (
    linking_status IN ('permission_only', 'linked', 'conflict', 'duplicate_pole')
  ),
  linking_method TEXT NOT NULL CHECK (linking_method IN ('auto', 'manual', 'gps_match')),
  confidence REAL CHECK (confidence IS NULL OR (confidence >= 0.0 AND confidence <= 1.0)),
  revision INTEGER NOT NULL CHECK (revision >= 1),
  link_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (linking_status != 'linked' OR assignment_id IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS permission_conflicts (
  conflict_id TEXT PRIMARY KEY,
  link_id TEXT NOT NULL REFERENCES permission_links(link_id),
  permission_id TEXT NOT NULL,
  project_id TEXT NOT NULL,
  conflict_type TEXT NOT NULL,
  resolution_status TEXT NOT NULL CHECK (
    resolution_status IN ('pending', 'resolved', 'escalated')
  ),
  conflict_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciliation_reports (
  report_id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT NOT NULL,
  completed_at_ns INTEGER NOT NULL,
  report_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_permissions_project_created
  ON permissions(project_id, created_at_ns, permission_id);
CREATE INDEX IF NOT EXISTS idx_assignments_property ON assignments(project_id, property_id);
CREATE INDEX IF NOT EXISTS idx_assignments_nad ON assignments(project_id, one_map_nad_id);
CREATE INDEX IF NOT EXISTS idx_links_assignment ON permission_links(assignment_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_link ON permission_conflicts(link_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_project_status
  ON permission_conflicts(project_id, resolution_status, created_at_ns);
CREATE INDEX IF NOT EXISTS idx_reports_project_completed
  ON reconciliation_reports(project_id, completed_at_ns);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS link_events (
  sequence INTEGER PRIMARY KEY AUTOINCREMENT,
  link_id TEXT NOT NULL REFERENCES permission_links(link_id),
  permission_id TEXT NOT NULL,
  revision INTEGER NOT NULL,
  from_status TEXT,
  to_status TEXT NOT NULL,
  assignment_id TEXT,
  linking_method TEXT NOT NULL,
  confidence REAL,
  actor TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE (link_id, revision)
);

CREATE TABLE IF NOT EXISTS reconciliation_configs (
  project_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  config_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (project_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_links_one_linked_per_assignment
  ON permission_links(assignment_id) WHERE linking_status = 'linked';
CREATE INDEX IF NOT EXISTS idx_assignments_geo ON assignments(project_id, latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_link_events_permission ON link_events(permission_id, sequence);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "database schema version {version} is newer than supported {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version >= target {
                continue;
            }
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration {target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration {target}"))?;
            version = target;
        }

        Ok(())
    }

    /// Store one permission record. Records are immutable once stored.
    ///
    /// # Errors
    /// Returns an error when validation fails or the permission id already exists.
    pub fn insert_permission(&mut self, record: &PermissionRecord) -> Result<()> {
        record.validate().context("permission validation failed")?;
        let point = record.location.point;
        self.conn
            .execute(
                "INSERT INTO permissions(
                    permission_id, project_id, property_id, one_map_nad_id, latitude, longitude,
                    created_at, created_at_ns, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.permission_id.as_str(),
                    record.project_id,
                    record.property_id(),
                    record.one_map_nad_id(),
                    point.map(|point| point.lat),
                    point.map(|point| point.lon),
                    rfc3339(record.created_at)?,
                    unix_nanos(record.created_at)?,
                    to_json(record)?,
                ],
            )
            .with_context(|| format!("failed to insert permission {}", record.permission_id))?;
        Ok(())
    }

    /// Store one assignment record.
    ///
    /// # Errors
    /// Returns an error when validation fails or the assignment id already exists.
    pub fn insert_assignment(&mut self, record: &AssignmentRecord) -> Result<()> {
        record.validate().context("assignment validation failed")?;
        let point = record.location.point;
        self.conn
            .execute(
                "INSERT INTO assignments(
                    assignment_id, project_id, pole_number, property_id, one_map_nad_id,
                    latitude, longitude, created_at, created_at_ns, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.assignment_id.as_str(),
                    record.project_id,
                    record.pole_number(),
                    record.property_id(),
                    record.one_map_nad_id(),
                    point.map(|point| point.lat),
                    point.map(|point| point.lon),
                    rfc3339(record.created_at)?,
                    unix_nanos(record.created_at)?,
                    to_json(record)?,
                ],
            )
            .with_context(|| format!("failed to insert assignment {}", record.assignment_id))?;
        Ok(())
    }

    /// Persist a new config version for a project. Stored versions are never overwritten.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or its version is already stored.
    pub fn save_config(&mut self, project_id: &str, config: &ReconciliationConfig) -> Result<()> {
        if project_id.trim().is_empty() {
            return Err(anyhow!("project_id MUST be provided when saving a config"));
        }
        config.validate().context("config validation failed")?;
        self.conn
            .execute(
                "INSERT INTO reconciliation_configs(project_id, version, config_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    project_id,
                    i64::from(config.version),
                    to_json(config)?,
                    now_rfc3339()?
                ],
            )
            .with_context(|| {
                format!("failed to store config version {} for {project_id}", config.version)
            })?;
        Ok(())
    }

    /// Highest stored config version for a project, if any.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn load_config(&self, project_id: &str) -> Result<Option<ReconciliationConfig>> {
        let raw = self
            .conn
            .query_row(
                "SELECT config_json FROM reconciliation_configs
                 WHERE project_id = ?1 ORDER BY version DESC LIMIT 1",
                params![project_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read reconciliation config")?;
        raw.map(|raw| from_json(&raw, "reconciliation config")).transpose()
    }

    /// Most recent report of a run that got through its whole batch. Timed-out runs stay in
    /// [`SqliteStore::recent_reports`] but never count as the latest reconciliation.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn latest_report(&self, project_id: &str) -> Result<Option<ReconciliationReport>> {
        let raw = self
            .conn
            .query_row(
                "SELECT report_json FROM reconciliation_reports
                 WHERE project_id = ?1
                   AND COALESCE(json_extract(report_json, '$.timed_out'), 0) = 0
                 ORDER BY completed_at_ns DESC, report_id DESC
                 LIMIT 1",
                params![project_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read latest reconciliation report")?;
        raw.map(|raw| from_json(&raw, "reconciliation report")).transpose()
    }

    /// Every persisted report for a project, timed-out runs included, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn recent_reports(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT report_json FROM reconciliation_reports
             WHERE project_id = ?1
             ORDER BY completed_at_ns DESC, report_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, sql_limit(limit)], |row| {
            row.get::<_, String>(0)
        })?;

        let mut reports = Vec::new();
        for raw in rows {
            reports.push(from_json(&raw?, "reconciliation report")?);
        }
        Ok(reports)
    }

    /// Permission and link-status counts for the dashboard summary.
    ///
    /// # Errors
    /// Returns an error when the count queries fail.
    pub fn status_counts(&self, project_id: &str) -> Result<StatusCounts> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM permissions WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("failed to count permissions")?;

        let mut counts =
            StatusCounts { total_permissions: usize::try_from(total)?, ..StatusCounts::default() };
        let mut stmt = self.conn.prepare(
            "SELECT linking_status, COUNT(*) FROM permission_links
             WHERE project_id = ?1 GROUP BY linking_status",
        )?;
        let mut rows = stmt.query(params![project_id])?;
        while let Some(row) = rows.next()? {
            let status_raw: String = row.get(0)?;
            let count = usize::try_from(row.get::<_, i64>(1)?)?;
            match LinkingStatus::parse(&status_raw) {
                Some(LinkingStatus::Linked) => counts.linked = count,
                Some(LinkingStatus::Conflict) => counts.conflict = count,
                Some(LinkingStatus::DuplicatePole) => counts.duplicate = count,
                Some(LinkingStatus::PermissionOnly) => {}
                None => return Err(anyhow!("unknown linking_status: {status_raw}")),
            }
        }
        Ok(counts)
    }

    /// PENDING and ESCALATED conflicts for a project, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn unresolved_conflicts(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<PermissionConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT conflict_json FROM permission_conflicts
             WHERE project_id = ?1 AND resolution_status IN ('pending', 'escalated')
             ORDER BY created_at_ns DESC, conflict_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, sql_limit(limit)], |row| {
            row.get::<_, String>(0)
        })?;

        let mut conflicts = Vec::new();
        for raw in rows {
            conflicts.push(from_json(&raw?, "permission conflict")?);
        }
        Ok(conflicts)
    }

    /// Append-only transition log of one permission's link, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn link_history(&self, permission_id: &PermissionId) -> Result<Vec<LinkEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                sequence, link_id, permission_id, revision, from_status, to_status,
                assignment_id, linking_method, confidence, actor, recorded_at
             FROM link_events
             WHERE permission_id = ?1
             ORDER BY sequence ASC",
        )?;
        let mut rows = stmt.query(params![permission_id.as_str()])?;
        let mut events = Vec::new();

        while let Some(row) = rows.next()? {
            let link_id_raw: String = row.get(1)?;
            let from_status_raw: Option<String> = row.get(4)?;
            let to_status_raw: String = row.get(5)?;
            let method_raw: String = row.get(7)?;

            events.push(LinkEvent {
                sequence: u64::try_from(row.get::<_, i64>(0)?)?,
                link_id: LinkId(
                    link_id_raw
                        .parse()
                        .with_context(|| format!("invalid ULID: {link_id_raw}"))?,
                ),
                permission_id: PermissionId(row.get(2)?),
                revision: u64::try_from(row.get::<_, i64>(3)?)?,
                from_status: from_status_raw
                    .map(|raw| {
                        LinkingStatus::parse(&raw)
                            .ok_or_else(|| anyhow!("unknown linking_status: {raw}"))
                    })
                    .transpose()?,
                to_status: LinkingStatus::parse(&to_status_raw)
                    .ok_or_else(|| anyhow!("unknown linking_status: {to_status_raw}"))?,
                assignment_id: row.get::<_, Option<String>>(6)?.map(AssignmentId),
                linking_method: LinkingMethod::parse(&method_raw)
                    .ok_or_else(|| anyhow!("unknown linking_method: {method_raw}"))?,
                confidence: row.get(8)?,
                actor: row.get(9)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
            });
        }

        Ok(events)
    }

    /// Write an online `SQLite` backup to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory or the backup cannot be created.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn load_unlinked(&self, project_id: &str, limit: usize) -> Result<PermissionBatch> {
        let mut stmt = self.conn.prepare(
            "SELECT p.permission_id, p.record_json
             FROM permissions p
             LEFT JOIN permission_links l ON l.permission_id = p.permission_id
             WHERE p.project_id = ?1
               AND (
                 l.link_id IS NULL
                 OR (l.linking_status = 'permission_only' AND l.linking_method != 'manual')
               )
             ORDER BY p.created_at_ns ASC, p.permission_id ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![project_id, sql_limit(limit)])?;
        let mut batch = PermissionBatch::default();

        while let Some(row) = rows.next()? {
            let permission_id = PermissionId(row.get(0)?);
            let raw: String = row.get(1)?;
            let decoded = serde_json::from_str::<PermissionRecord>(&raw)
                .map_err(|err| EngineError::Validation(format!("undecodable record: {err}")))
                .and_then(|record| record.validate().map(|()| record));
            match decoded {
                Ok(record) => batch.permissions.push(record),
                Err(error) => {
                    batch
                        .rejected
                        .push(RejectedRecord { permission_id: Some(permission_id), error });
                }
            }
        }

        Ok(batch)
    }

    fn load_assignments_near(
        &self,
        project_id: &str,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<AssignmentRecord>> {
        let window = point.bounding_box(radius_meters);
        let (min_lon, max_lon) =
            if window.lon_wraps { (-180.0, 180.0) } else { (window.min_lon, window.max_lon) };
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM assignments
             WHERE project_id = ?1
               AND latitude BETWEEN ?2 AND ?3
               AND longitude BETWEEN ?4 AND ?5
             ORDER BY created_at_ns ASC, assignment_id ASC",
        )?;
        let rows = stmt.query_map(
            params![project_id, window.min_lat, window.max_lat, min_lon, max_lon],
            |row| row.get::<_, String>(0),
        )?;

        let mut nearby = Vec::new();
        for raw in rows {
            let record: AssignmentRecord = from_json(&raw?, "assignment")?;
            let within = record
                .location
                .point
                .is_some_and(|other| point.distance_meters(&other) <= radius_meters);
            if within {
                nearby.push(record);
            }
        }
        Ok(nearby)
    }

    fn load_assignment_by_exact_id(
        &self,
        project_id: &str,
        key: ExactKey<'_>,
    ) -> Result<Option<AssignmentRecord>> {
        let (sql, value) = match key {
            ExactKey::PropertyId(value) => (
                "SELECT record_json FROM assignments WHERE project_id = ?1 AND property_id = ?2
                 ORDER BY created_at_ns ASC, assignment_id ASC LIMIT 1",
                value,
            ),
            ExactKey::OneMapNadId(value) => (
                "SELECT record_json FROM assignments WHERE project_id = ?1 AND one_map_nad_id = ?2
                 ORDER BY created_at_ns ASC, assignment_id ASC LIMIT 1",
                value,
            ),
        };
        let raw = self
            .conn
            .query_row(sql, params![project_id, value], |row| row.get::<_, String>(0))
            .optional()
            .context("failed to look up assignment by identifier")?;
        raw.map(|raw| from_json(&raw, "assignment")).transpose()
    }

    fn load_record<T: DeserializeOwned>(
        &self,
        sql: &str,
        id: &str,
        what: &str,
    ) -> Result<Option<T>> {
        let raw = self
            .conn
            .query_row(sql, params![id], |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("failed to read {what} {id}"))?;
        raw.map(|raw| from_json(&raw, what)).transpose()
    }

    fn load_link(&self, sql: &str, id: &str) -> Result<Option<Link>> {
        let row = self
            .conn
            .query_row(sql, params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()
            .with_context(|| format!("failed to read link for {id}"))?;
        let Some((raw, revision)) = row else {
            return Ok(None);
        };
        let mut link: Link = from_json(&raw, "link")?;
        link.revision = u64::try_from(revision)?;
        Ok(Some(link))
    }

    fn load_links(&self, sql: &str, id: &str) -> Result<Vec<Link>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .with_context(|| format!("failed to read links for {id}"))?;

        let mut links = Vec::new();
        for row in rows {
            let (raw, revision) = row?;
            let mut link: Link = from_json(&raw, "link")?;
            link.revision = u64::try_from(revision)?;
            links.push(link);
        }
        Ok(links)
    }

    fn write_link(&mut self, link: &Link, actor: &str) -> Result<Link> {
        link.validate()?;
        if actor.trim().is_empty() {
            return Err(
                EngineError::Validation("actor MUST be provided for link writes".into()).into()
            );
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start link transaction")?;

        let current = tx
            .query_row(
                "SELECT revision, linking_status FROM permission_links WHERE permission_id = ?1",
                params![link.permission_id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to read current link revision")?;
        let stored_revision = match &current {
            Some((revision, _)) => u64::try_from(*revision)?,
            None => 0,
        };
        if stored_revision != link.revision {
            return Err(EngineError::StaleWrite(format!(
                "link for permission {} is at revision {stored_revision}, write expected {}",
                link.permission_id, link.revision
            ))
            .into());
        }
        let from_status = current
            .map(|(_, raw)| {
                LinkingStatus::parse(&raw).ok_or_else(|| anyhow!("unknown linking_status: {raw}"))
            })
            .transpose()?;

        let mut stored = link.clone();
        stored.revision = link.revision + 1;
        let revision = i64::try_from(stored.revision)?;
        let link_json = to_json(&stored)?;
        let assignment_id = stored.assignment_id.as_ref().map(AssignmentId::as_str);

        if from_status.is_some() {
            tx.execute(
                "UPDATE permission_links SET
                    assignment_id = ?2, pole_number = ?3, linking_status = ?4,
                    linking_method = ?5, confidence = ?6, revision = ?7, link_json = ?8,
                    updated_at = ?9
                 WHERE permission_id = ?1 AND revision = ?10",
                params![
                    stored.permission_id.as_str(),
                    assignment_id,
                    stored.pole_number,
                    stored.linking_status.as_str(),
                    stored.linking_method.as_str(),
                    stored.confidence,
                    revision,
                    link_json,
                    rfc3339(stored.updated_at)?,
                    i64::try_from(link.revision)?,
                ],
            )
            .context("failed to update link")?;
        } else {
            tx.execute(
                "INSERT INTO permission_links(
                    link_id, permission_id, project_id, assignment_id, pole_number,
                    linking_status, linking_method, confidence, revision, link_json,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    stored.link_id.to_string(),
                    stored.permission_id.as_str(),
                    stored.project_id,
                    assignment_id,
                    stored.pole_number,
                    stored.linking_status.as_str(),
                    stored.linking_method.as_str(),
                    stored.confidence,
                    revision,
                    link_json,
                    rfc3339(stored.created_at)?,
                    rfc3339(stored.updated_at)?,
                ],
            )
            .context("failed to insert link")?;
        }

        tx.execute(
            "INSERT INTO link_events(
                link_id, permission_id, revision, from_status, to_status, assignment_id,
                linking_method, confidence, actor, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                stored.link_id.to_string(),
                stored.permission_id.as_str(),
                revision,
                from_status.map(LinkingStatus::as_str),
                stored.linking_status.as_str(),
                assignment_id,
                stored.linking_method.as_str(),
                stored.confidence,
                actor,
                rfc3339(stored.updated_at)?,
            ],
        )
        .context("failed to append link event")?;

        tx.commit().context("failed to commit link transaction")?;
        Ok(stored)
    }

    fn write_conflict(&mut self, conflict: &PermissionConflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO permission_conflicts(
                    conflict_id, link_id, permission_id, project_id, conflict_type,
                    resolution_status, conflict_json, created_at, created_at_ns, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    conflict.conflict_id.to_string(),
                    conflict.link_id.to_string(),
                    conflict.permission_id.as_str(),
                    conflict.project_id,
                    conflict.conflict_type.as_str(),
                    conflict.resolution.status.as_str(),
                    to_json(conflict)?,
                    rfc3339(conflict.created_at)?,
                    unix_nanos(conflict.created_at)?,
                    rfc3339(conflict.updated_at)?,
                ],
            )
            .context("failed to insert permission conflict")?;
        Ok(())
    }

    fn close_conflicts(
        &mut self,
        link_id: LinkId,
        resolution: &ConflictResolution,
    ) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let open = {
            let mut stmt = tx.prepare(
                "SELECT conflict_id, conflict_json FROM permission_conflicts
                 WHERE link_id = ?1 AND resolution_status != 'resolved'",
            )?;
            let rows = stmt.query_map(params![link_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut open = Vec::new();
            for row in rows {
                open.push(row?);
            }
            open
        };

        for (conflict_id, raw) in &open {
            let mut conflict: PermissionConflict = from_json(raw, "permission conflict")?;
            conflict.resolution = resolution.clone();
            if let Some(resolved_at) = resolution.resolved_at {
                conflict.updated_at = resolved_at;
            }
            tx.execute(
                "UPDATE permission_conflicts
                 SET resolution_status = ?2, conflict_json = ?3, updated_at = ?4
                 WHERE conflict_id = ?1",
                params![
                    conflict_id,
                    conflict.resolution.status.as_str(),
                    to_json(&conflict)?,
                    rfc3339(conflict.updated_at)?,
                ],
            )
            .context("failed to resolve permission conflict")?;
        }

        tx.commit().context("failed to commit conflict resolution")?;
        Ok(open.len())
    }

    fn write_report(&mut self, report: &ReconciliationReport) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reconciliation_reports(
                    report_id, project_id, started_at, completed_at, completed_at_ns, report_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    report.report_id.to_string(),
                    report.project_id,
                    rfc3339(report.started_at)?,
                    rfc3339(report.completed_at)?,
                    unix_nanos(report.completed_at)?,
                    to_json(report)?,
                ],
            )
            .context("failed to insert reconciliation report")?;
        Ok(())
    }

    fn load_pole_number_collisions(&self, project_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT pole_number FROM permission_links
             WHERE project_id = ?1 AND linking_status = 'linked' AND pole_number IS NOT NULL
             GROUP BY pole_number
             HAVING COUNT(DISTINCT assignment_id) > 1
             ORDER BY pole_number ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?;
        let mut poles = Vec::new();
        for row in rows {
            poles.push(row?);
        }
        Ok(poles)
    }
}

impl RecordStore for SqliteStore {
    fn unlinked_permissions(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<PermissionBatch, EngineError> {
        self.load_unlinked(project_id, limit).map_err(engine_error)
    }

    fn assignments_near(
        &self,
        project_id: &str,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<AssignmentRecord>, EngineError> {
        self.load_assignments_near(project_id, point, radius_meters).map_err(engine_error)
    }

    fn assignment_by_exact_id(
        &self,
        project_id: &str,
        key: ExactKey<'_>,
    ) -> Result<Option<AssignmentRecord>, EngineError> {
        self.load_assignment_by_exact_id(project_id, key).map_err(engine_error)
    }

    fn assignment(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<AssignmentRecord>, EngineError> {
        self.load_record(
            "SELECT record_json FROM assignments WHERE assignment_id = ?1",
            assignment_id.as_str(),
            "assignment",
        )
        .map_err(engine_error)
    }

    fn permission(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<PermissionRecord>, EngineError> {
        self.load_record(
            "SELECT record_json FROM permissions WHERE permission_id = ?1",
            permission_id.as_str(),
            "permission",
        )
        .map_err(engine_error)
    }

    fn link_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Option<Link>, EngineError> {
        self.load_link(
            "SELECT link_json, revision FROM permission_links
             WHERE assignment_id = ?1 AND linking_status = 'linked'",
            assignment_id.as_str(),
        )
        .map_err(engine_error)
    }

    fn links_under_review_by_assignment_id(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Vec<Link>, EngineError> {
        self.load_links(
            "SELECT link_json, revision FROM permission_links
             WHERE assignment_id = ?1 AND linking_status IN ('conflict', 'duplicate_pole')
             ORDER BY created_at ASC, permission_id ASC",
            assignment_id.as_str(),
        )
        .map_err(engine_error)
    }

    fn link_by_permission_id(
        &self,
        permission_id: &PermissionId,
    ) -> Result<Option<Link>, EngineError> {
        self.load_link(
            "SELECT link_json, revision FROM permission_links WHERE permission_id = ?1",
            permission_id.as_str(),
        )
        .map_err(engine_error)
    }

    fn upsert_link(&mut self, link: &Link, actor: &str) -> Result<Link, EngineError> {
        self.write_link(link, actor).map_err(engine_error)
    }

    fn insert_conflict(&mut self, conflict: &PermissionConflict) -> Result<(), EngineError> {
        self.write_conflict(conflict).map_err(engine_error)
    }

    fn resolve_conflicts(
        &mut self,
        link_id: LinkId,
        resolution: &ConflictResolution,
    ) -> Result<usize, EngineError> {
        self.close_conflicts(link_id, resolution).map_err(engine_error)
    }

    fn insert_report(&mut self, report: &ReconciliationReport) -> Result<(), EngineError> {
        self.write_report(report).map_err(engine_error)
    }

    fn linked_pole_number_collisions(&self, project_id: &str) -> Result<Vec<String>, EngineError> {
        self.load_pole_number_collisions(project_id).map_err(engine_error)
    }
}

/// Classify an adapter failure into the engine's error taxonomy.
///
/// Busy and locked databases are transient; unique-key violations are conflicts; other
/// constraint violations are validation errors. Returns `None` for failures that carry neither
/// an [`EngineError`] nor a `SQLite` error code.
#[must_use]
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    if let Some(engine) = err.downcast_ref::<EngineError>() {
        return Some(engine.kind());
    }
    let Some(rusqlite::Error::SqliteFailure(failure, _)) = err.downcast_ref::<rusqlite::Error>()
    else {
        return None;
    };
    let kind = match failure.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::TransientStore,
        ErrorCode::ConstraintViolation
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            ErrorKind::Conflict
        }
        ErrorCode::ConstraintViolation => ErrorKind::Validation,
        _ => ErrorKind::FatalStore,
    };
    Some(kind)
}

fn engine_error(err: anyhow::Error) -> EngineError {
    if let Some(engine) = err.downcast_ref::<EngineError>() {
        return engine.clone();
    }
    let message = format!("{err:#}");
    match error_kind(&err).unwrap_or(ErrorKind::FatalStore) {
        ErrorKind::Validation => EngineError::Validation(message),
        ErrorKind::TransientStore => EngineError::TransientStore(message),
        ErrorKind::Conflict => EngineError::Conflict(message),
        ErrorKind::StaleWrite => EngineError::StaleWrite(message),
        ErrorKind::FatalStore => EngineError::FatalStore(message),
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize row payload")
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to deserialize stored {what}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}
