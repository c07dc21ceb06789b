use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use pole_link_api::{
    ConfigView, MigrateResult, NotFound, PoleLinkApi, RunRequest, API_CONTRACT_VERSION,
};
use pole_link_core::{
    AssignmentRecord, ErrorKind, Link, LinkEvent, LinkingStatusSummary, ManualLinkRequest,
    PermissionConflict, PermissionId, PermissionRecord, ReconciliationConfig,
    ReconciliationReport,
};
use pole_link_store_sqlite::{error_kind, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone)]
struct ServiceState {
    api: PoleLinkApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pole-link-service")]
#[command(about = "Local HTTP service for permission-to-assignment reconciliation")]
struct Args {
    #[arg(long, default_value = "./pole_link.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let (status, kind) = if err.downcast_ref::<NotFound>().is_some() {
            (StatusCode::NOT_FOUND, "not_found")
        } else {
            match error_kind(&err) {
                Some(ErrorKind::Validation) => (StatusCode::BAD_REQUEST, "validation"),
                Some(kind @ (ErrorKind::Conflict | ErrorKind::StaleWrite)) => {
                    (StatusCode::CONFLICT, kind.as_str())
                }
                Some(kind @ (ErrorKind::FatalStore | ErrorKind::TransientStore)) => {
                    (StatusCode::SERVICE_UNAVAILABLE, kind.as_str())
                }
                None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            }
        };
        if status.is_server_error() {
            warn!(error = %format!("{err:#}"), error_kind = kind, "request failed");
        }

        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind: kind,
            error: format!("{err:#}"),
            status,
        }
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/records/permissions", post(records_add_permission))
        .route("/v1/records/assignments", post(records_add_assignment))
        .route("/v1/reconcile/run", post(reconcile_run))
        .route("/v1/links/manual", post(links_manual))
        .route("/v1/links/:permission_id", get(links_show))
        .route("/v1/links/:permission_id/history", get(links_history))
        .route("/v1/projects/:project_id/config", get(config_show).put(config_set))
        .route("/v1/projects/:project_id/reports", get(reports_list))
        .route("/v1/projects/:project_id/reports/latest", get(reports_latest))
        .route("/v1/projects/:project_id/summary", get(project_summary))
        .route("/v1/projects/:project_id/conflicts", get(conflicts_list))
        .with_state(state)
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let state = ServiceState { api: PoleLinkApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "pole-link service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(envelope(state.api.schema_status()?))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    Ok(envelope(state.api.migrate(request.dry_run)?))
}

async fn records_add_permission(
    State(state): State<ServiceState>,
    Json(record): Json<PermissionRecord>,
) -> ServiceResult<PermissionRecord> {
    Ok(envelope(state.api.add_permission(record)?))
}

async fn records_add_assignment(
    State(state): State<ServiceState>,
    Json(record): Json<AssignmentRecord>,
) -> ServiceResult<AssignmentRecord> {
    Ok(envelope(state.api.add_assignment(record)?))
}

async fn reconcile_run(
    State(state): State<ServiceState>,
    Json(request): Json<RunRequest>,
) -> ServiceResult<ReconciliationReport> {
    Ok(envelope(state.api.run_reconciliation(request)?))
}

async fn links_manual(
    State(state): State<ServiceState>,
    Json(request): Json<ManualLinkRequest>,
) -> ServiceResult<Link> {
    Ok(envelope(state.api.submit_manual_link(&request)?))
}

async fn links_show(
    State(state): State<ServiceState>,
    Path(permission_id): Path<String>,
) -> ServiceResult<Link> {
    Ok(envelope(state.api.link_show(&PermissionId(permission_id))?))
}

async fn links_history(
    State(state): State<ServiceState>,
    Path(permission_id): Path<String>,
) -> ServiceResult<Vec<LinkEvent>> {
    Ok(envelope(state.api.link_history(&PermissionId(permission_id))?))
}

async fn config_show(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
) -> ServiceResult<ConfigView> {
    Ok(envelope(state.api.get_config(&project_id)?))
}

async fn config_set(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
    Json(config): Json<ReconciliationConfig>,
) -> ServiceResult<ConfigView> {
    Ok(envelope(state.api.put_config(&project_id, config)?))
}

async fn reports_list(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ServiceResult<Vec<ReconciliationReport>> {
    Ok(envelope(state.api.recent_reports(&project_id, query.limit)?))
}

async fn reports_latest(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
) -> ServiceResult<ReconciliationReport> {
    Ok(envelope(state.api.latest_report(&project_id)?))
}

async fn project_summary(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
) -> ServiceResult<LinkingStatusSummary> {
    Ok(envelope(state.api.status_summary(&project_id)?))
}

async fn conflicts_list(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ServiceResult<Vec<PermissionConflict>> {
    Ok(envelope(state.api.unresolved_conflicts(&project_id, query.limit)?))
}
