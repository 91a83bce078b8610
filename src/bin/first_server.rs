//! `first-server` — the HTTP binding for the RPC Facade (spec.md §6).
//!
//! Routing, form decoding, and envelope shaping live here; everything else
//! is `first_core::facade::Facade`. Structured request fields
//! (`functions`, `ids`) arrive as JSON-encoded strings inside an
//! `application/x-www-form-urlencoded` body rather than as nested form
//! keys — the wire shape this core was built to accept, not a framework
//! default.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use first_core::engine_manager::EngineManager;
use first_core::error::FirstError;
use first_core::facade::{
    Facade, MetadataAddRequest, MetadataScanRequest, ScannedFunction, SubmittedFunction,
};
use first_core::store::{FunctionStore, MetadataStore, UserStore};
use first_core::{Metrics, ServerConfig};

type AppState = Arc<Facade>;

/// Wraps `FirstError` for axum's `IntoResponse`. Unauthorized becomes a
/// bare 401 (spec.md §6); every other kind becomes the
/// `{"failed":true,"msg":"..."}` envelope at HTTP 200, matching the
/// original REST surface's convention of reporting domain failures in the
/// body rather than in the status line.
struct ApiError(FirstError);

impl From<FirstError> for ApiError {
    fn from(err: FirstError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            FirstError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            other => {
                (StatusCode::OK, Json(json!({ "failed": true, "msg": other.to_string() }))).into_response()
            }
        }
    }
}

fn envelope_ok(mut value: Value) -> Json<Value> {
    if let Value::Object(ref mut map) = value {
        map.insert("failed".to_string(), Value::Bool(false));
    }
    Json(value)
}

fn bad_json(field: &str) -> ApiError {
    ApiError(FirstError::InputInvalid(format!("{field} is not valid JSON")))
}

#[derive(Debug, Deserialize)]
struct CheckinForm {
    md5: String,
    crc32: u32,
    sha1: Option<String>,
    sha256: Option<String>,
}

async fn checkin(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<CheckinForm>,
) -> Result<Json<Value>, ApiError> {
    let user = state.authenticate(api_key)?;
    let ok = state.checkin(&user, &form.md5, form.crc32, form.sha1.as_deref(), form.sha256.as_deref());
    Ok(envelope_ok(json!({ "result": ok })))
}

async fn test_connection(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.authenticate(api_key)?;
    Ok(envelope_ok(state.test_connection()))
}

async fn architectures(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.authenticate(api_key)?;
    Ok(envelope_ok(json!({ "architectures": state.architectures() })))
}

#[derive(Debug, Deserialize)]
struct MetadataAddForm {
    md5: String,
    crc32: u32,
    functions: String,
}

async fn metadata_add(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<MetadataAddForm>,
) -> Result<Json<Value>, ApiError> {
    let user = state.authenticate(api_key)?;
    let functions: HashMap<String, SubmittedFunction> =
        serde_json::from_str(&form.functions).map_err(|_| bad_json("functions"))?;
    let response = state.metadata_add(
        &user,
        MetadataAddRequest {
            md5: form.md5,
            crc32: form.crc32,
            functions,
        },
    )?;
    Ok(envelope_ok(serde_json::to_value(response).expect("serializable")))
}

#[derive(Debug, Deserialize)]
struct IdsForm {
    ids: String,
}

async fn metadata_get(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<IdsForm>,
) -> Result<Json<Value>, ApiError> {
    state.authenticate(api_key)?;
    let ids: Vec<String> = serde_json::from_str(&form.ids).map_err(|_| bad_json("ids"))?;
    let results = state.metadata_get(&ids)?;
    Ok(envelope_ok(json!({ "results": results })))
}

async fn metadata_history(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<IdsForm>,
) -> Result<Json<Value>, ApiError> {
    state.authenticate(api_key)?;
    let ids: Vec<String> = serde_json::from_str(&form.ids).map_err(|_| bad_json("ids"))?;
    let results = state.metadata_history(&ids)?;
    Ok(envelope_ok(json!({ "results": results })))
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    id: String,
}

async fn metadata_delete(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<DeleteForm>,
) -> Result<Json<Value>, ApiError> {
    let user = state.authenticate(api_key)?;
    let ok = state.metadata_delete(&user, &form.id);
    Ok(envelope_ok(json!({ "result": ok })))
}

#[derive(Debug, Deserialize)]
struct CreatedQuery {
    #[serde(default = "default_page")]
    page: usize,
}

fn default_page() -> usize {
    1
}

async fn metadata_created(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Query(query): Query<CreatedQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = state.authenticate(api_key)?;
    let page = state.metadata_created(&user, query.page);
    Ok(envelope_ok(serde_json::to_value(page).expect("serializable")))
}

#[derive(Debug, Deserialize)]
struct AppliedForm {
    md5: String,
    crc32: u32,
    id: String,
}

async fn metadata_applied(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<AppliedForm>,
) -> Result<Json<Value>, ApiError> {
    let user = state.authenticate(api_key)?;
    let ok = state.metadata_applied(&user, &form.md5, form.crc32, &form.id)?;
    Ok(envelope_ok(json!({ "result": ok })))
}

async fn metadata_unapplied(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<AppliedForm>,
) -> Result<Json<Value>, ApiError> {
    let user = state.authenticate(api_key)?;
    let ok = state.metadata_unapplied(&user, &form.md5, form.crc32, &form.id)?;
    Ok(envelope_ok(json!({ "result": ok })))
}

#[derive(Debug, Deserialize)]
struct ScanForm {
    functions: String,
}

async fn metadata_scan(
    State(state): State<AppState>,
    Path(api_key): Path<Uuid>,
    Form(form): Form<ScanForm>,
) -> Result<Json<Value>, ApiError> {
    state.authenticate(api_key)?;
    let functions: HashMap<String, ScannedFunction> =
        serde_json::from_str(&form.functions).map_err(|_| bad_json("functions"))?;
    let results = state.metadata_scan(MetadataScanRequest { functions })?;
    Ok(envelope_ok(serde_json::to_value(results).expect("serializable")))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    uptime_secs: u64,
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.metrics.snapshot()).expect("serializable"))
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_secs: state.metrics.snapshot().uptime_secs,
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/{api_key}/test_connection", get(test_connection))
        .route("/api/{api_key}/architectures", get(architectures))
        .route("/api/{api_key}/checkin", post(checkin))
        .route("/api/{api_key}/metadata/add", post(metadata_add))
        .route("/api/{api_key}/metadata/get", post(metadata_get))
        .route("/api/{api_key}/metadata/history", post(metadata_history))
        .route("/api/{api_key}/metadata/delete", post(metadata_delete))
        .route("/api/{api_key}/metadata/created", get(metadata_created))
        .route("/api/{api_key}/metadata/applied", post(metadata_applied))
        .route("/api/{api_key}/metadata/unapplied", post(metadata_unapplied))
        .route("/api/{api_key}/metadata/scan", post(metadata_scan))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter.clone()))
        .init();

    let users = Arc::new(UserStore::new());
    let functions = Arc::new(FunctionStore::new());
    let metadata = Arc::new(MetadataStore::new());
    let engines = Arc::new(EngineManager::with_default_catalog(
        functions.clone(),
        metadata.clone(),
        users.clone(),
    ));
    let metrics = Arc::new(Metrics::new());

    let bind_addr = config.bind_addr.clone();
    let facade = Arc::new(Facade::new(users, functions, metadata, engines, metrics, config));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "first-server listening");
    axum::serve(listener, router(facade)).await?;
    Ok(())
}
