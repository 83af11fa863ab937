use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use properties_api::{
    AddBundleRequest, AddBundleValueRequest, AddSettingRequest, AssignRequest, PropertiesApi,
};
use properties_core::{BundleId, UserId};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "props")]
#[command(about = "Per-user bundle settings CLI")]
struct Cli {
    #[arg(long, env = "APP_DB_USERS", default_value = "./users.sqlite3")]
    users_db: PathBuf,

    #[arg(long, env = "APP_DB_SETTINGS", default_value = "./settings.sqlite3")]
    settings_db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Bundle {
        #[command(subcommand)]
        command: BundleCommand,
    },
    Tag {
        #[command(subcommand)]
        command: TagCommand,
    },
    Setting {
        #[command(subcommand)]
        command: SettingCommand,
    },
    Value {
        #[command(subcommand)]
        command: ValueCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum BundleCommand {
    Add(BundleAddArgs),
    List,
}

#[derive(Debug, Args)]
struct BundleAddArgs {
    #[arg(long)]
    id: i64,
    #[arg(long, default_value_t = 0)]
    parent_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TagCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum SettingCommand {
    Add {
        #[arg(long)]
        name: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum ValueCommand {
    Add(ValueAddArgs),
}

#[derive(Debug, Args)]
struct ValueAddArgs {
    #[arg(long)]
    bundle_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    value: String,
    #[arg(long, value_parser = parse_timestamp)]
    created_at: Option<OffsetDateTime>,
    #[arg(long, value_parser = parse_timestamp)]
    expired_at: Option<OffsetDateTime>,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    SetTag(TagArgs),
    UnsetTag(TagArgs),
    SetBundles(BundlesArgs),
    UnsetBundles(BundlesArgs),
    Settings(SettingsArgs),
}

#[derive(Debug, Args)]
struct TagArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    tag: String,
    /// Ignored by `unset-tag`: dropping keeps the current expiry.
    #[arg(long, value_parser = parse_timestamp)]
    expire: Option<OffsetDateTime>,
}

#[derive(Debug, Args)]
struct BundlesArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long = "bundle", required = true)]
    bundles: Vec<String>,
    /// Ignored by `unset-bundles`: dropping keeps the current expiry.
    #[arg(long, value_parser = parse_timestamp)]
    expire: Option<OffsetDateTime>,
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long, value_parser = parse_timestamp)]
    when: Option<OffsetDateTime>,
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("expected RFC3339 timestamp: {err}"))
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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = PropertiesApi::new(cli.users_db.clone(), cli.settings_db.clone());
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Bundle { command } => run_bundle(command, &api),
        Command::Tag { command: TagCommand::List } => {
            emit_json(serde_json::json!({ "tags": api.list_tags()? }))
        }
        Command::Setting { command } => run_setting(command, &api),
        Command::Value { command: ValueCommand::Add(args) } => run_value_add(args, &api),
        Command::User { command } => run_user(command, &api),
    }
}

fn run_db(command: DbCommand, api: &PropertiesApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            let up_to_date =
                status.users.pending_versions.is_empty() && status.settings.pending_versions.is_empty();
            emit_json(serde_json::json!({
                "users": status.users,
                "settings": status.settings,
                "up_to_date": up_to_date
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::json!({
                "ok": report.is_ok(),
                "users": report.users,
                "settings": report.settings
            }))
        }
    }
}

fn run_bundle(command: BundleCommand, api: &PropertiesApi) -> Result<()> {
    match command {
        BundleCommand::Add(args) => {
            let bundle = api.add_bundle(AddBundleRequest {
                id: BundleId(args.id),
                parent_id: BundleId(args.parent_id),
                name: args.name,
                tag: args.tag,
            })?;
            emit_json(serde_json::json!({ "bundle": bundle }))
        }
        BundleCommand::List => emit_json(serde_json::json!({ "bundles": api.list_bundles()? })),
    }
}

fn run_setting(command: SettingCommand, api: &PropertiesApi) -> Result<()> {
    match command {
        SettingCommand::Add { name } => {
            let setting = api.add_setting(&AddSettingRequest { name })?;
            emit_json(serde_json::json!({ "setting": setting }))
        }
        SettingCommand::List => emit_json(serde_json::json!({ "settings": api.list_settings()? })),
    }
}

fn run_value_add(args: ValueAddArgs, api: &PropertiesApi) -> Result<()> {
    let value = api.add_bundle_value(AddBundleValueRequest {
        bundle_id: BundleId(args.bundle_id),
        name: args.name,
        value: args.value,
        created_at: args.created_at,
        expired_at: args.expired_at,
    })?;
    emit_json(serde_json::json!({ "value": value }))
}

fn run_user(command: UserCommand, api: &PropertiesApi) -> Result<()> {
    let version = match command {
        UserCommand::SetTag(args) => api.set_tag(&tag_request(args))?,
        UserCommand::UnsetTag(args) => api.unset_tag(&tag_request(args))?,
        UserCommand::SetBundles(args) => api.set_bundles(&bundles_request(args))?,
        UserCommand::UnsetBundles(args) => api.unset_bundles(&bundles_request(args))?,
        UserCommand::Settings(args) => {
            let settings = api.get_settings(UserId(args.user_id), args.when)?;
            return emit_json(serde_json::json!({
                "user_id": args.user_id,
                "settings": settings
            }));
        }
    };
    emit_json(serde_json::json!({ "assignment": version }))
}

fn tag_request(args: TagArgs) -> AssignRequest {
    AssignRequest { user_id: UserId(args.user_id), items: vec![args.tag], expire: args.expire }
}

fn bundles_request(args: BundlesArgs) -> AssignRequest {
    AssignRequest { user_id: UserId(args.user_id), items: args.bundles, expire: args.expire }
}
