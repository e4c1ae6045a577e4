//! Sheet Repair - validation and repair sessions for metadata spreadsheets.

mod completion;
mod config;
mod dataset;
mod error;
mod export;
mod field_check;
mod patch;
mod report;
mod schema;
mod session;
mod sheet_parser;
mod validator;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use config::AppConfig;
use dataset::CellValue;
use error::{AppError, InputFileError};
use export::ExportFormat;
use field_check::{FieldCheckRegistry, FieldKey, FieldStatus, RemoteUrlCheck};
use patch::Patch;
use report::{ColumnFilter, ErrorType};
use schema::SchemaDescriptor;
use serde::Deserialize;
use session::{
    AdherenceReport, AdherenceView, BatchTarget, CompletenessReport, CompletenessView, GroupApproval,
    NewSession, SessionOverview, SessionStore, TableQuery,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::ValidatorClient;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    sessions: SessionStore,
    validator: Arc<ValidatorClient>,
    field_checks: FieldCheckRegistry,
    url_check: Option<Arc<RemoteUrlCheck>>,
    config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "sheet_repair=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!("Validation service: {}", config.validator_url);

    let http = reqwest::Client::new();
    let url_check = match &config.url_check_url {
        Some(url) => {
            info!("URL reachability checks via {}", url);
            Some(Arc::new(RemoteUrlCheck::new(http.clone(), url.clone())))
        }
        None => {
            warn!("URL_CHECK_URL not set; URL fields are checked for syntax only");
            None
        }
    };

    let state = AppState {
        sessions: SessionStore::new(),
        validator: Arc::new(ValidatorClient::new(http, config.validator_url.clone())),
        field_checks: FieldCheckRegistry::new(config.field_check_debounce),
        url_check,
        config: Arc::new(config.clone()),
    };

    spawn_idle_sweep(state.clone(), config.session_idle_ttl);

    let app = Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/schema", get(get_schema))
        .route("/sessions/:id/completeness", get(get_completeness))
        .route(
            "/sessions/:id/completeness/:column",
            get(get_completeness_table).post(save_completeness),
        )
        .route("/sessions/:id/adherence", get(get_adherence))
        .route("/sessions/:id/adherence/:error_type", get(get_adherence_groups))
        .route("/sessions/:id/adherence/:error_type/accept", post(accept_adherence))
        .route("/sessions/:id/patches", get(list_patches))
        .route("/sessions/:id/patches/batch", post(batch_patch))
        .route(
            "/sessions/:id/patches/:row/:column",
            get(get_patch).put(put_patch).delete(delete_patch),
        )
        .route(
            "/sessions/:id/fields/:row/:column/check",
            get(get_field_check).post(check_field),
        )
        .route("/sessions/:id/export", get(export_session))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Upload a spreadsheet, validate it and open a repair session.
async fn create_session(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SessionOverview>, AppError> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("metadata.csv").to_string();
            file_data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err(InputFileError::invalid("No file was uploaded.").into());
    }
    info!("Received file: {} ({} bytes)", filename, file_data.len());

    let parsed = sheet_parser::parse_upload(&filename, &file_data, &state.config.upload)?;
    let response = state
        .validator
        .validate(&parsed.dataset, &parsed.template_iri)
        .await?;
    response.schema.ensure_covers(&response.data, &response.reporting)?;

    let id = state.sessions.create(NewSession {
        input_file_name: filename,
        input_size: file_data.len(),
        template_iri: parsed.template_iri,
        schema: response.schema,
        dataset: response.data,
        findings: response.reporting,
        auxiliary_sheets: parsed.auxiliary_sheets,
    });
    Ok(Json(state.sessions.read(&id, |s| s.overview())?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionOverview>, AppError> {
    Ok(Json(state.sessions.read(&id, |s| s.overview())?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.sessions.remove(&id) {
        return Err(AppError::SessionNotFound(id));
    }
    state.field_checks.forget_session(&id);
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn get_schema(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SchemaDescriptor>, AppError> {
    Ok(Json(state.sessions.read(&id, |s| s.schema.clone())?))
}

async fn get_completeness(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CompletenessReport>, AppError> {
    Ok(Json(state.sessions.read(&id, |s| s.completeness_report())?))
}

/// Repair table for one column.
///
/// Query: `page`, `rows_per_page` (0 or absent = all) and any number of
/// `filter.<column>=<text>` filters.
async fn get_completeness_table(
    State(state): State<AppState>,
    Path((id, column)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CompletenessView>, AppError> {
    let query = table_query(&params)?;
    let view = state.sessions.read(&id, |s| s.completeness_view(&column, &query))??;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct CellEdit {
    row: usize,
    /// `null` clears the cell's patch.
    value: Option<CellValue>,
}

#[derive(Deserialize)]
struct SaveCompletenessRequest {
    edits: Vec<CellEdit>,
}

async fn save_completeness(
    State(state): State<AppState>,
    Path((id, column)): Path<(String, String)>,
    Json(request): Json<SaveCompletenessRequest>,
) -> Result<Json<SessionOverview>, AppError> {
    let edits: Vec<_> = request.edits.into_iter().map(|e| (e.row, e.value)).collect();
    state.sessions.update(&id, |s| {
        s.save_completeness(&column, edits, &state.field_checks)?;
        Ok(s.overview())
    })
    .map(Json)
}

async fn get_adherence(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AdherenceReport>, AppError> {
    Ok(Json(state.sessions.read(&id, |s| s.adherence_report())?))
}

async fn get_adherence_groups(
    State(state): State<AppState>,
    Path((id, error_type)): Path<(String, String)>,
) -> Result<Json<AdherenceView>, AppError> {
    let error_type = parse_error_type(&error_type)?;
    let view = state.sessions.read(&id, |s| s.adherence_view(error_type))??;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct AcceptRequest {
    groups: Vec<GroupApproval>,
}

async fn accept_adherence(
    State(state): State<AppState>,
    Path((id, error_type)): Path<(String, String)>,
    Json(request): Json<AcceptRequest>,
) -> Result<Json<SessionOverview>, AppError> {
    let error_type = parse_error_type(&error_type)?;
    state.sessions.update(&id, |s| {
        s.accept_adherence(error_type, &request.groups, &state.field_checks)?;
        Ok(s.overview())
    })
    .map(Json)
}

async fn list_patches(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Patch>>, AppError> {
    Ok(Json(state.sessions.read(&id, |s| s.overlay.to_patch_array())?))
}

#[derive(Deserialize)]
struct BatchRequest {
    column: String,
    value: CellValue,
    target: BatchTarget,
}

async fn batch_patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = state
        .sessions
        .update(&id, |s| {
            s.batch_set(&request.column, &request.target, &request.value, &state.field_checks)
        })?;
    Ok(Json(serde_json::json!({ "updated": count })))
}

async fn get_patch(
    State(state): State<AppState>,
    Path((id, row, column)): Path<(String, usize, String)>,
) -> Result<Json<Option<Patch>>, AppError> {
    Ok(Json(state.sessions.read(&id, |s| s.overlay.get(row, &column).cloned())?))
}

#[derive(Deserialize)]
struct PatchRequest {
    #[serde(default)]
    value: CellValue,
}

/// Set one cell. A value whose field check failed is not saved.
async fn put_patch(
    State(state): State<AppState>,
    Path((id, row, column)): Path<(String, usize, String)>,
    Json(request): Json<PatchRequest>,
) -> Result<Json<Patch>, AppError> {
    let patch = state
        .sessions
        .update(&id, |s| s.set_patch(row, &column, request.value, &state.field_checks))?;
    Ok(Json(patch))
}

async fn delete_patch(
    State(state): State<AppState>,
    Path((id, row, column)): Path<(String, usize, String)>,
) -> Result<Json<Option<Patch>>, AppError> {
    let removed = state.sessions.update(&id, |s| Ok(s.remove_patch(row, &column)))?;
    Ok(Json(removed))
}

#[derive(Deserialize)]
struct CheckRequest {
    value: String,
}

/// Schedule a debounced check of the value being typed into a field.
async fn check_field(
    State(state): State<AppState>,
    Path((id, row, column)): Path<(String, usize, String)>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<FieldStatus>, AppError> {
    let descriptor = state.sessions.read(&id, |s| s.schema.column(&column).cloned())?;
    let descriptor = descriptor.map_err(|_| AppError::BadRequest(format!("Unknown column '{}'", column)))?;
    let key = FieldKey { session: id, row, column };

    match field_check::checker_for(&descriptor, state.url_check.clone()) {
        Some(checker) => {
            state.field_checks.schedule(key.clone(), request.value, checker);
        }
        None => {
            state.field_checks.settle(key.clone(), FieldStatus::Valid);
        }
    }
    Ok(Json(state.field_checks.status(&key)))
}

async fn get_field_check(
    State(state): State<AppState>,
    Path((id, row, column)): Path<(String, usize, String)>,
) -> Result<Json<FieldStatus>, AppError> {
    state.sessions.read(&id, |_| ())?;
    Ok(Json(state.field_checks.status(&FieldKey { session: id, row, column })))
}

#[derive(Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

/// Download the repaired spreadsheet.
async fn export_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, AppError> {
    let format = match query.format.as_deref() {
        None => ExportFormat::Csv,
        Some(f) => ExportFormat::parse(f)
            .ok_or_else(|| AppError::BadRequest(format!("Unsupported export format: {}", f)))?,
    };
    let file = state.sessions.read(&id, |s| s.export(format))??;
    Ok((
        [
            (header::CONTENT_TYPE, file.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.file_name),
            ),
        ],
        file.bytes,
    ))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Periodically discard sessions nobody has touched within `ttl`, along with
/// their field checks.
fn spawn_idle_sweep(state: AppState, ttl: std::time::Duration) {
    let period = (ttl / 4).max(std::time::Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let expired = state.sessions.sweep_idle(ttl, std::time::Instant::now());
            for id in &expired {
                state.field_checks.forget_session(id);
            }
            if !expired.is_empty() {
                info!("Expired {} idle sessions; {} remain", expired.len(), state.sessions.len());
            }
        }
    });
}

fn parse_error_type(s: &str) -> Result<ErrorType, AppError> {
    ErrorType::parse(s).ok_or_else(|| AppError::BadRequest(format!("Unknown error type: {}", s)))
}

fn table_query(params: &HashMap<String, String>) -> Result<TableQuery, AppError> {
    let number = |key: &str| -> Result<usize, AppError> {
        match params.get(key) {
            Some(v) => v
                .parse()
                .map_err(|_| AppError::BadRequest(format!("{} must be a non-negative number", key))),
            None => Ok(0),
        }
    };
    let mut filters: Vec<ColumnFilter> = params
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("filter.").map(|column| ColumnFilter {
                column: column.to_string(),
                value: v.clone(),
            })
        })
        .collect();
    filters.sort_by(|a, b| a.column.cmp(&b.column));
    Ok(TableQuery {
        filters,
        page: number("page")?,
        rows_per_page: number("rows_per_page")?,
    })
}
