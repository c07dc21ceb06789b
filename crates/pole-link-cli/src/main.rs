use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pole_link_api::{load_config_file, PoleLinkApi, RunRequest};
use pole_link_core::{
    AssignmentId, AssignmentRecord, ManualLinkRequest, PermissionId, PermissionRecord,
};
use pole_link_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "plk")]
#[command(about = "Permission-to-assignment reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./pole_link.sqlite3")]
    db: PathBuf,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Reconcile {
        #[command(subcommand)]
        command: ReconcileCommand,
    },
    Link {
        #[command(subcommand)]
        command: LinkCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    Summary(ProjectArgs),
    Conflicts {
        #[command(subcommand)]
        command: ConflictsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    AddPermission(RecordFileArgs),
    AddAssignment(RecordFileArgs),
    Import(RecordImportArgs),
}

#[derive(Debug, Args)]
struct RecordFileArgs {
    /// JSON file holding one record.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct RecordImportArgs {
    /// NDJSON file of records tagged with `"kind": "permission" | "assignment"`.
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Set(ConfigSetArgs),
    Show(ProjectArgs),
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[arg(long)]
    project: String,
    /// YAML config file.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ProjectArgs {
    #[arg(long)]
    project: String,
}

#[derive(Debug, Args)]
struct ProjectListArgs {
    #[arg(long)]
    project: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
enum ReconcileCommand {
    Run(ReconcileRunArgs),
}

#[derive(Debug, Args)]
struct ReconcileRunArgs {
    #[arg(long)]
    project: String,
    #[arg(long, default_value = pole_link_api::DEFAULT_RUN_ACTOR)]
    actor: String,
    #[arg(long)]
    as_of: Option<String>,
    /// YAML config used for this run only, instead of the stored version.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    Manual(LinkManualArgs),
    Show(PermissionArgs),
    History(PermissionArgs),
}

#[derive(Debug, Args)]
struct LinkManualArgs {
    #[arg(long)]
    permission: String,
    /// Omit to confirm the permission has no assignment.
    #[arg(long)]
    assignment: Option<String>,
    #[arg(long)]
    confirmed_by: String,
    #[arg(long, default_value_t = false)]
    override_conflicts: bool,
    #[arg(long)]
    expected_updated_at: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct PermissionArgs {
    #[arg(long)]
    permission: String,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Latest(ProjectArgs),
    List(ProjectListArgs),
}

#[derive(Debug, Subcommand)]
enum ConflictsCommand {
    List(ProjectListArgs),
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(env_filter).with(layer.json()).init();
        }
        LogFormat::Text => tracing_subscriber::registry().with(env_filter).with(layer).init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    tracing::debug!(db = %cli.db.display(), "plk starting");

    let api = PoleLinkApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &api, &mut store)
        }
        Command::Record { command } => run_record(command, &api),
        Command::Config { command } => run_config(command, &api),
        Command::Reconcile { command: ReconcileCommand::Run(args) } => run_reconcile(args, &api),
        Command::Link { command } => run_link(command, &api),
        Command::Report { command } => match command {
            ReportCommand::Latest(args) => emit(&api.latest_report(&args.project)?),
            ReportCommand::List(args) => {
                let reports = api.recent_reports(&args.project, args.limit)?;
                emit_json(serde_json::json!({
                    "project_id": args.project,
                    "reports": reports
                }))
            }
        },
        Command::Summary(args) => emit(&api.status_summary(&args.project)?),
        Command::Conflicts { command: ConflictsCommand::List(args) } => {
            let conflicts = api.unresolved_conflicts(&args.project, args.limit)?;
            emit_json(serde_json::json!({
                "project_id": args.project,
                "conflicts": conflicts
            }))
        }
    }
}

fn run_db(command: DbCommand, api: &PoleLinkApi, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => emit(&store.integrity_check()?),
    }
}

fn run_record(command: RecordCommand, api: &PoleLinkApi) -> Result<()> {
    match command {
        RecordCommand::AddPermission(args) => {
            let record: PermissionRecord = read_json_file(&args.file)?;
            emit(&api.add_permission(record)?)
        }
        RecordCommand::AddAssignment(args) => {
            let record: AssignmentRecord = read_json_file(&args.file)?;
            emit(&api.add_assignment(record)?)
        }
        RecordCommand::Import(args) => {
            let file = fs::File::open(&args.input)
                .with_context(|| format!("failed to open import file {}", args.input.display()))?;
            let result = api.import_ndjson(BufReader::new(file))?;
            emit_json(serde_json::json!({
                "in_file": args.input,
                "imported": result
            }))
        }
    }
}

fn run_config(command: ConfigCommand, api: &PoleLinkApi) -> Result<()> {
    match command {
        ConfigCommand::Set(args) => {
            let config = load_config_file(&args.file)?;
            emit(&api.put_config(&args.project, config)?)
        }
        ConfigCommand::Show(args) => emit(&api.get_config(&args.project)?),
    }
}

fn run_reconcile(args: ReconcileRunArgs, api: &PoleLinkApi) -> Result<()> {
    let config = args.config.as_deref().map(load_config_file).transpose()?;
    let as_of = args.as_of.as_deref().map(parse_rfc3339).transpose()?;
    let report = api.run_reconciliation(RunRequest {
        project_id: args.project,
        actor: args.actor,
        as_of,
        config,
    })?;
    emit(&report)
}

fn run_link(command: LinkCommand, api: &PoleLinkApi) -> Result<()> {
    match command {
        LinkCommand::Manual(args) => {
            let request = ManualLinkRequest {
                permission_id: PermissionId(args.permission),
                assignment_id: args.assignment.map(AssignmentId),
                confirmed_by: args.confirmed_by,
                override_conflicts: args.override_conflicts,
                expected_updated_at: args
                    .expected_updated_at
                    .as_deref()
                    .map(parse_rfc3339)
                    .transpose()?,
                notes: args.notes,
            };
            emit(&api.submit_manual_link(&request)?)
        }
        LinkCommand::Show(args) => emit(&api.link_show(&PermissionId(args.permission))?),
        LinkCommand::History(args) => {
            let events = api.link_history(&PermissionId(args.permission.clone()))?;
            emit_json(serde_json::json!({
                "permission_id": args.permission,
                "events": events
            }))
        }
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read JSON file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON record in {}", path.display()))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
