use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pole_link_core::{
    summarize, submit_manual_link, AssignmentRecord, Link, LinkEvent, LinkingStatusSummary,
    ManualLinkRequest, PermissionConflict, PermissionId, PermissionRecord, ReconciliationConfig,
    ReconciliationReport, ReconciliationRunner, RecordStore, RunContext,
};
use pole_link_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_RUN_ACTOR: &str = "reconciler";

/// Lookup of a record that does not exist.
#[derive(Debug, thiserror::Error)]
#[error("{entity} not found: {id}")]
pub struct NotFound {
    pub entity: &'static str,
    pub id: String,
}

impl NotFound {
    fn new(entity: &'static str, id: impl Into<String>) -> Self {
        Self { entity, id: id.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// One line of an NDJSON ingest file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestRecord {
    Permission(PermissionRecord),
    Assignment(AssignmentRecord),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub permissions: usize,
    pub assignments: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Stored,
    Default,
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigView {
    pub project_id: String,
    pub source: ConfigSource,
    pub config: ReconciliationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub project_id: String,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
    /// Run with this config instead of the project's stored version.
    #[serde(default)]
    pub config: Option<ReconciliationConfig>,
}

fn default_actor() -> String {
    DEFAULT_RUN_ACTOR.to_string()
}

impl RunRequest {
    #[must_use]
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), actor: default_actor(), as_of: None, config: None }
    }
}

/// Parse and validate a YAML config document.
///
/// # Errors
/// Returns an error when the YAML is malformed or the config fails validation.
pub fn config_from_yaml(raw: &str) -> Result<ReconciliationConfig> {
    let config: ReconciliationConfig =
        serde_yaml::from_str(raw).context("failed to parse reconciliation config YAML")?;
    config.validate().context("reconciliation config is invalid")?;
    Ok(config)
}

/// Read a YAML config file.
///
/// # Errors
/// Returns an error when the file cannot be read or its content is not a valid config.
pub fn load_config_file(path: &Path) -> Result<ReconciliationConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    config_from_yaml(&raw)
}

#[derive(Debug, Clone)]
pub struct PoleLinkApi {
    db_path: PathBuf,
}

impl PoleLinkApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_permission(&self, record: PermissionRecord) -> Result<PermissionRecord> {
        let mut store = self.open_migrated()?;
        store.insert_permission(&record)?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_assignment(&self, record: AssignmentRecord) -> Result<AssignmentRecord> {
        let mut store = self.open_migrated()?;
        store.insert_assignment(&record)?;
        Ok(record)
    }

    /// Ingest an NDJSON stream of tagged permission and assignment records.
    ///
    /// Every line is parsed before anything is stored, so a malformed line stores nothing.
    ///
    /// # Errors
    /// Returns an error naming the first malformed line, or the first record that fails to store.
    pub fn import_ndjson(&self, reader: impl BufRead) -> Result<ImportResult> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line_number = index + 1;
            let line = line.with_context(|| format!("failed to read line {line_number}"))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: IngestRecord = serde_json::from_str(&line)
                .with_context(|| format!("invalid ingest record on line {line_number}"))?;
            records.push(record);
        }

        let mut store = self.open_migrated()?;
        let mut result = ImportResult::default();
        for record in &records {
            match record {
                IngestRecord::Permission(permission) => {
                    store.insert_permission(permission)?;
                    result.permissions += 1;
                }
                IngestRecord::Assignment(assignment) => {
                    store.insert_assignment(assignment)?;
                    result.assignments += 1;
                }
            }
        }

        info!(
            permissions = result.permissions,
            assignments = result.assignments,
            "imported ingest records"
        );
        Ok(result)
    }

    /// Store a new config version for a project.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or the version already exists.
    pub fn put_config(&self, project_id: &str, config: ReconciliationConfig) -> Result<ConfigView> {
        let mut store = self.open_migrated()?;
        store.save_config(project_id, &config)?;
        Ok(ConfigView { project_id: project_id.to_string(), source: ConfigSource::Stored, config })
    }

    /// Config a run would use for the project: the latest stored version, else defaults.
    ///
    /// # Errors
    /// Returns an error when the stored config cannot be read.
    pub fn get_config(&self, project_id: &str) -> Result<ConfigView> {
        let store = self.open_migrated()?;
        effective_config(&store, project_id)
    }

    /// Run one batch reconciliation for a project and persist its report.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or the run aborts on a fatal store failure.
    pub fn run_reconciliation(&self, request: RunRequest) -> Result<ReconciliationReport> {
        let mut store = self.open_migrated()?;
        let view = match request.config {
            Some(config) => ConfigView {
                project_id: request.project_id.clone(),
                source: ConfigSource::Override,
                config,
            },
            None => effective_config(&store, &request.project_id)?,
        };

        let ctx = RunContext {
            project_id: request.project_id,
            actor: request.actor,
            as_of: request.as_of.unwrap_or_else(OffsetDateTime::now_utc),
        };
        let mut runner = ReconciliationRunner::new(&mut store, view.config)?;
        let report = runner.run(&ctx)?;
        Ok(report)
    }

    /// # Errors
    /// Returns an error when the request is rejected or persistence fails.
    pub fn submit_manual_link(&self, request: &ManualLinkRequest) -> Result<Link> {
        let mut store = self.open_migrated()?;
        let link = submit_manual_link(&mut store, request, OffsetDateTime::now_utc())?;
        Ok(link)
    }

    /// # Errors
    /// Returns [`NotFound`] when the project has no report yet.
    pub fn latest_report(&self, project_id: &str) -> Result<ReconciliationReport> {
        let store = self.open_migrated()?;
        let report = store
            .latest_report(project_id)?
            .ok_or_else(|| NotFound::new("reconciliation report", project_id))?;
        Ok(report)
    }

    /// # Errors
    /// Returns an error when reports cannot be read.
    pub fn recent_reports(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationReport>> {
        let store = self.open_migrated()?;
        store.recent_reports(project_id, limit)
    }

    /// Dashboard counts and rates derived from the stored links.
    ///
    /// # Errors
    /// Returns an error when counts, report, or config cannot be read.
    pub fn status_summary(&self, project_id: &str) -> Result<LinkingStatusSummary> {
        let store = self.open_migrated()?;
        let counts = store.status_counts(project_id)?;
        let latest = store.latest_report(project_id)?;
        let view = effective_config(&store, project_id)?;
        Ok(summarize(
            project_id,
            counts,
            latest.as_ref(),
            view.config.reconciliation_interval_hours,
        ))
    }

    /// # Errors
    /// Returns an error when conflicts cannot be read.
    pub fn unresolved_conflicts(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<PermissionConflict>> {
        let store = self.open_migrated()?;
        store.unresolved_conflicts(project_id, limit)
    }

    /// # Errors
    /// Returns [`NotFound`] when the permission has no link.
    pub fn link_show(&self, permission_id: &PermissionId) -> Result<Link> {
        let store = self.open_migrated()?;
        let link = store
            .link_by_permission_id(permission_id)?
            .ok_or_else(|| NotFound::new("link", permission_id.as_str()))?;
        Ok(link)
    }

    /// # Errors
    /// Returns an error when the event log cannot be read.
    pub fn link_history(&self, permission_id: &PermissionId) -> Result<Vec<LinkEvent>> {
        let store = self.open_migrated()?;
        store.link_history(permission_id)
    }
}

fn effective_config(store: &SqliteStore, project_id: &str) -> Result<ConfigView> {
    let view = match store.load_config(project_id)? {
        Some(config) => ConfigView {
            project_id: project_id.to_string(),
            source: ConfigSource::Stored,
            config,
        },
        None => ConfigView {
            project_id: project_id.to_string(),
            source: ConfigSource::Default,
            config: ReconciliationConfig::default(),
        },
    };
    Ok(view)
}

#[cfg(test)]
mod tests {
    use pole_link_core::{
        AgentInfo, AssignmentId, EngineError, GeoPoint, LinkingMethod, LinkingStatus, Location,
    };
    use time::Duration;

    use super::*;

    const PROJECT: &str = "lawley";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("pole-link-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn ts(offset_seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_750_000_000 + offset_seconds)
    }

    fn permission(id: &str, property_id: Option<&str>, lat: f64) -> PermissionRecord {
        PermissionRecord {
            permission_id: PermissionId::from(id),
            project_id: PROJECT.to_string(),
            property_id: property_id.map(str::to_string),
            one_map_nad_id: None,
            location: Location {
                address: "12 Main Street".to_string(),
                point: Some(GeoPoint::new(lat, 28.05)),
            },
            agent: AgentInfo { name: "Thabo Mokoena".to_string(), ..AgentInfo::default() },
            created_at: ts(0),
        }
    }

    fn assignment(id: &str, property_id: Option<&str>, lat: f64) -> AssignmentRecord {
        AssignmentRecord {
            assignment_id: AssignmentId::from(id),
            project_id: PROJECT.to_string(),
            pole_number: Some(format!("LAW.P.{id}")),
            property_id: property_id.map(str::to_string),
            one_map_nad_id: None,
            location: Location {
                address: "12 Main Street".to_string(),
                point: Some(GeoPoint::new(lat, 28.05)),
            },
            agent: AgentInfo { name: "Thabo Mokoena".to_string(), ..AgentInfo::default() },
            created_at: ts(0),
        }
    }

    #[test]
    fn api_ingest_run_and_report_flow() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PoleLinkApi::new(db_path.clone());

        api.add_permission(permission("p-1", Some("P-100"), -26.10))?;
        api.add_assignment(assignment("a-1", Some("P-100"), -26.10))?;

        let report = api.run_reconciliation(RunRequest {
            as_of: Some(ts(3_600)),
            ..RunRequest::for_project(PROJECT)
        })?;
        assert_eq!(report.new_links, 1);
        assert_eq!(report.details.auto_linked, vec![PermissionId::from("p-1")]);

        let latest = api.latest_report(PROJECT)?;
        assert_eq!(latest.report_id, report.report_id);

        let link = api.link_show(&PermissionId::from("p-1"))?;
        assert_eq!(link.linking_status, LinkingStatus::Linked);
        assert_eq!(link.assignment_id, Some(AssignmentId::from("a-1")));

        let history = api.link_history(&PermissionId::from("p-1"))?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actor, DEFAULT_RUN_ACTOR);

        let summary = api.status_summary(PROJECT)?;
        assert_eq!(summary.linked_count, 1);
        assert!((summary.linking_rate - 100.0).abs() < 1e-9);
        assert_eq!(summary.last_reconciled_at, Some(report.completed_at));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_missing_report_and_link_are_not_found() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PoleLinkApi::new(db_path.clone());

        let Err(err) = api.latest_report(PROJECT) else {
            panic!("a project with no runs should have no report");
        };
        assert!(err.downcast_ref::<NotFound>().is_some());

        let Err(err) = api.link_show(&PermissionId::from("missing")) else {
            panic!("an unknown permission should have no link");
        };
        assert!(err.downcast_ref::<NotFound>().is_some());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_ndjson_import_rejects_malformed_lines_before_storing() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PoleLinkApi::new(db_path.clone());

        let permission_line = serde_json::to_string(&IngestRecord::Permission(permission(
            "p-1", None, -26.10,
        )))?;
        let assignment_line = serde_json::to_string(&IngestRecord::Assignment(assignment(
            "a-1", None, -26.10,
        )))?;

        let broken = format!("{permission_line}\n{{\"kind\":\"permission\"}}\n");
        let Err(err) = api.import_ndjson(broken.as_bytes()) else {
            panic!("malformed line should fail the import");
        };
        assert!(format!("{err:#}").contains("line 2"));
        assert_eq!(api.status_summary(PROJECT)?.total_permissions, 0);

        let valid = format!("{permission_line}\n\n{assignment_line}\n");
        let result = api.import_ndjson(valid.as_bytes())?;
        assert_eq!(result, ImportResult { permissions: 1, assignments: 1 });

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_config_versions_and_overrides() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PoleLinkApi::new(db_path.clone());

        let initial = api.get_config(PROJECT)?;
        assert_eq!(initial.source, ConfigSource::Default);
        assert_eq!(initial.config, ReconciliationConfig::default());

        let tuned = config_from_yaml("version: 2\ngps_proximity_meters: 50\n")?;
        api.put_config(PROJECT, tuned.clone())?;
        let stored = api.get_config(PROJECT)?;
        assert_eq!(stored.source, ConfigSource::Stored);
        assert_eq!(stored.config, tuned);

        assert!(config_from_yaml("auto_link_confidence_threshold: 1.5\n").is_err());

        // A far permission never links under the stored 50 m radius but does under an override.
        api.add_permission(permission("p-1", None, -26.10))?;
        api.add_assignment(assignment("a-1", None, -26.10063))?;
        let stored_run = api.run_reconciliation(RunRequest {
            as_of: Some(ts(3_600)),
            ..RunRequest::for_project(PROJECT)
        })?;
        assert_eq!(stored_run.config_version, 2);
        assert_eq!(stored_run.new_links, 0);

        let override_run = api.run_reconciliation(RunRequest {
            as_of: Some(ts(7_200)),
            config: Some(ReconciliationConfig {
                version: 3,
                auto_link_confidence_threshold: 0.3,
                ..ReconciliationConfig::default()
            }),
            ..RunRequest::for_project(PROJECT)
        })?;
        assert_eq!(override_run.config_version, 3);
        assert_eq!(override_run.new_links, 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_manual_link_confirms_and_rejects_stale_requests() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PoleLinkApi::new(db_path.clone());

        api.add_permission(permission("p-1", None, -26.10))?;
        api.add_assignment(assignment("a-1", None, -26.30))?;

        let request = ManualLinkRequest {
            permission_id: PermissionId::from("p-1"),
            assignment_id: Some(AssignmentId::from("a-1")),
            confirmed_by: "field.supervisor".to_string(),
            override_conflicts: false,
            expected_updated_at: None,
            notes: None,
        };
        let link = api.submit_manual_link(&request)?;
        assert_eq!(link.linking_status, LinkingStatus::Linked);
        assert_eq!(link.linking_method, LinkingMethod::Manual);

        let stale = ManualLinkRequest { expected_updated_at: Some(ts(0)), ..request };
        let Err(err) = api.submit_manual_link(&stale) else {
            panic!("stale manual link should be rejected");
        };
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::StaleWrite(_))));

        cleanup(&db_path);
        Ok(())
    }
}
