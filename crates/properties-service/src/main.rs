use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use properties_api::{
    AddBundleRequest, AddBundleValueRequest, AddSettingRequest, AssignRequest,
    DatabaseMigrateResult, DatabaseSchemaStatus, PropertiesApi, API_CONTRACT_VERSION,
};
use properties_core::{
    AssignmentVersion, Bundle, BundleValue, PropertiesError, Setting, SettingDefinition, UserId,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: PropertiesApi,
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
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SettingsQuery {
    when: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "properties-service")]
#[command(about = "HTTP service resolving per-user bundle settings")]
struct Args {
    #[arg(long, env = "APP_DB_USERS", default_value = "./users.sqlite3")]
    users_db: PathBuf,
    #[arg(long, env = "APP_DB_SETTINGS", default_value = "./settings.sqlite3")]
    settings_db: PathBuf,
    #[arg(long, env = "APP_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    /// Validation failures anywhere in the chain are the caller's fault; the
    /// rest is reported as a server error.
    fn from_api(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if err.chain().any(|cause| cause.is::<PropertiesError>()) {
            warn!(error = %message, "request rejected");
            return Self::bad_request(message);
        }

        error!(error = %message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message,
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;
type CreatedResult<T> = Result<(StatusCode, Json<ServiceEnvelope<T>>), ServiceError>;

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn respond<T: Serialize>(result: Result<T>) -> ServiceResult<T> {
    result.map(|data| Json(envelope(data))).map_err(|err| ServiceError::from_api(&err))
}

fn created<T: Serialize>(result: Result<T>) -> CreatedResult<T> {
    respond(result).map(|json| (StatusCode::CREATED, json))
}

/// Assignment writes wait on a per-user lock and `SQLite`; keep both off the
/// async workers.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.context("assignment write task failed")?
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/tags", get(list_tags))
        .route("/v1/bundles", get(list_bundles))
        .route("/v1/settings", get(list_settings))
        .route("/v1/settings/:user_id", get(get_settings))
        .route("/v1/set-tag", post(set_tag))
        .route("/v1/unset-tag", post(unset_tag))
        .route("/v1/set-bundles", post(set_bundles))
        .route("/v1/unset-bundles", post(unset_bundles))
        .route("/v1/catalog/bundles", post(add_bundle))
        .route("/v1/catalog/settings", post(add_setting))
        .route("/v1/catalog/values", post(add_bundle_value))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let api = PropertiesApi::new(args.users_db.clone(), args.settings_db.clone());
    let state = ServiceState { api };
    state.api.migrate(false)?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        bind = %args.bind,
        users_db = %args.users_db.display(),
        settings_db = %args.settings_db.display(),
        "properties-service listening"
    );

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    info!("properties-service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    info!("shutdown signal received");
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<DatabaseSchemaStatus> {
    respond(state.api.schema_status())
}

async fn db_migrate(
    State(state): State<ServiceState>,
    request: Result<Json<MigrateRequest>, JsonRejection>,
) -> ServiceResult<DatabaseMigrateResult> {
    let Json(request) = request?;
    respond(state.api.migrate(request.dry_run))
}

async fn list_tags(State(state): State<ServiceState>) -> ServiceResult<Vec<String>> {
    respond(state.api.list_tags())
}

async fn list_bundles(State(state): State<ServiceState>) -> ServiceResult<Vec<Bundle>> {
    respond(state.api.list_bundles())
}

async fn list_settings(State(state): State<ServiceState>) -> ServiceResult<Vec<String>> {
    respond(state.api.list_settings())
}

async fn get_settings(
    State(state): State<ServiceState>,
    user_id: Result<Path<i64>, PathRejection>,
    query: Result<Query<SettingsQuery>, QueryRejection>,
) -> ServiceResult<Vec<Setting>> {
    let Path(user_id) = user_id?;
    let Query(query) = query?;
    let when = match query.when.as_deref() {
        Some(raw) => Some(OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
            ServiceError::bad_request(format!("`when` MUST be an RFC3339 timestamp: {err}"))
        })?),
        None => None,
    };
    respond(state.api.get_settings(UserId(user_id), when))
}

async fn set_tag(
    State(state): State<ServiceState>,
    request: Result<Json<AssignRequest>, JsonRejection>,
) -> CreatedResult<AssignmentVersion> {
    let Json(request) = request?;
    let api = state.api;
    created(run_blocking(move || api.set_tag(&request)).await)
}

async fn unset_tag(
    State(state): State<ServiceState>,
    request: Result<Json<AssignRequest>, JsonRejection>,
) -> CreatedResult<AssignmentVersion> {
    let Json(request) = request?;
    let api = state.api;
    created(run_blocking(move || api.unset_tag(&request)).await)
}

async fn set_bundles(
    State(state): State<ServiceState>,
    request: Result<Json<AssignRequest>, JsonRejection>,
) -> CreatedResult<AssignmentVersion> {
    let Json(request) = request?;
    let api = state.api;
    created(run_blocking(move || api.set_bundles(&request)).await)
}

async fn unset_bundles(
    State(state): State<ServiceState>,
    request: Result<Json<AssignRequest>, JsonRejection>,
) -> CreatedResult<AssignmentVersion> {
    let Json(request) = request?;
    let api = state.api;
    created(run_blocking(move || api.unset_bundles(&request)).await)
}

async fn add_bundle(
    State(state): State<ServiceState>,
    request: Result<Json<AddBundleRequest>, JsonRejection>,
) -> ServiceResult<Bundle> {
    let Json(request) = request?;
    respond(state.api.add_bundle(request))
}

async fn add_setting(
    State(state): State<ServiceState>,
    request: Result<Json<AddSettingRequest>, JsonRejection>,
) -> ServiceResult<SettingDefinition> {
    let Json(request) = request?;
    respond(state.api.add_setting(&request))
}

async fn add_bundle_value(
    State(state): State<ServiceState>,
    request: Result<Json<AddBundleValueRequest>, JsonRejection>,
) -> ServiceResult<BundleValue> {
    let Json(request) = request?;
    respond(state.api.add_bundle_value(request))
}
