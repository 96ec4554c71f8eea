#![cfg(not(tarpaulin_include))]

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::auth::{Session, require_identity};
use crate::config::Config;
use crate::downloader;
use crate::error::{FlashError, Result};
use crate::executor::{ExecutorConfig, execute};
use crate::expiry::{Badge, Expiry};
use crate::graph;
use crate::loader::Upload;
use crate::projects::{ListQuery, ProjectMeta, ProjectStore, ProjectSummary};
use crate::workspace::{Event, Page, Workspace, WorkspaceView};

/// Multipart field carrying uploaded files.
const UPLOAD_FIELD: &str = "files";

/// How often idle workspaces are looked for.
const EVICT_INTERVAL: Duration = Duration::from_secs(60);

/// A session's workspace and when it was last used.
#[derive(Default)]
struct Slot {
    workspace: Workspace,
    touched: Option<Instant>,
}

pub struct AppState {
    pub config: Config,
    pub projects: ProjectStore,
    executor: ExecutorConfig,
    workspaces: Mutex<HashMap<String, Slot>>,
}

impl AppState {
    pub fn new(config: Config, projects: ProjectStore) -> Self {
        let executor = ExecutorConfig {
            max_operations: config.max_operations,
        };
        AppState {
            config,
            projects,
            executor,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    fn workspaces(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // a panic mid-transition leaves a whole workspace behind, never half of one
        self.workspaces.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A session's workspace, created on first use and marked as used now.
    fn touch<'a>(map: &'a mut HashMap<String, Slot>, key: &str) -> &'a mut Workspace {
        let slot = map.entry(key.to_string()).or_default();
        slot.touched = Some(Instant::now());
        &mut slot.workspace
    }

    /// Current state of a session's workspace, created on first use.
    fn read<R>(&self, key: &str, f: impl FnOnce(&Workspace) -> R) -> R {
        let mut map = self.workspaces();
        f(&*Self::touch(&mut map, key))
    }

    /// Drop workspaces unused for longer than the configured idle time.
    ///
    /// # Returns
    /// * `usize` - Number of workspaces dropped
    pub fn evict_idle(&self, now: Instant) -> usize {
        let idle = Duration::from_secs(self.config.workspace_idle_minutes.saturating_mul(60));
        let mut map = self.workspaces();
        let before = map.len();
        map.retain(|_, slot| {
            slot.touched
                .is_some_and(|t| now.saturating_duration_since(t) <= idle)
        });
        before - map.len()
    }

    pub fn workspace_count(&self) -> usize {
        self.workspaces().len()
    }

    /// Apply an event to a session's workspace
    ///
    /// When the event changes the data or the committed snippet, the snippet
    /// is run again on the blocking pool and its report recorded, unless the
    /// inputs changed again while it ran.
    ///
    /// # Returns
    /// * `Result<WorkspaceView>` - The workspace after the event (and run)
    pub async fn dispatch(&self, key: &str, event: Event) -> Result<WorkspaceView> {
        let rerun = event.changes_inputs();
        let job = {
            let mut map = self.workspaces();
            let ws = Self::touch(&mut map, key);
            *ws = std::mem::take(ws).apply(event);
            if rerun {
                ws.should_execute()
                    .map(|code| (code.to_string(), ws.registry.clone(), ws.generation))
            } else {
                None
            }
        };

        if let Some((code, registry, generation)) = job {
            let config = self.executor.clone();
            let report = tokio::task::spawn_blocking(move || execute(&code, &registry, &config))
                .await
                .map_err(|e| FlashError::Internal(format!("snippet run aborted: {}", e)))?;

            let mut map = self.workspaces();
            let ws = Self::touch(&mut map, key);
            *ws = std::mem::take(ws).apply(Event::RunFinished { generation, report });
        }

        Ok(self.read(key, Workspace::view))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    message: Option<String>,
}

impl IntoResponse for FlashError {
    fn into_response(self) -> Response {
        let status = match &self {
            FlashError::NotFound(_) => StatusCode::NOT_FOUND,
            FlashError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("request failed: {}", self);
        }
        let body = StatusResponse {
            status: "error".to_string(),
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct RunRequest {
    code: String,
}

#[derive(Deserialize)]
struct SaveFormRequest {
    open: bool,
}

#[derive(Deserialize)]
struct PageRequest {
    page: Page,
}

#[derive(Deserialize)]
struct SaveRequest {
    author: String,
    name: String,
}

#[derive(Deserialize, Default)]
struct UpdateRequest {
    author: Option<String>,
    name: Option<String>,
}

#[derive(Serialize)]
struct SavedResponse {
    status: String,
    id: String,
    workspace: WorkspaceView,
}

#[derive(Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    confirm: bool,
}

#[derive(Deserialize)]
struct ExpiryRequest {
    expires_at: Option<String>,
}

/// Build the application router
///
/// `/health` is open; everything under `/api` requires the identity header.
///
/// # Arguments
/// * `state` - Shared application state
pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_mb.saturating_mul(1024 * 1024);
    let api = Router::new()
        .route("/api/workspace", get(get_workspace))
        .route(
            "/api/workspace/uploads",
            post(upload_files).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/workspace/reset", post(reset_workspace))
        .route("/api/workspace/run", post(run_snippet))
        .route("/api/workspace/figure.html", get(figure_html))
        .route("/api/workspace/export", get(export_combined))
        .route("/api/workspace/save-form", post(toggle_save_form))
        .route("/api/workspace/page", post(navigate))
        .route("/api/workspace/save", post(save_project))
        .route("/api/workspace/update", post(update_project))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/:id", axum::routing::delete(delete_project))
        .route("/api/projects/:id/load", post(load_project))
        .route("/api/projects/:id/delete-request", post(request_delete))
        .route("/api/projects/:id/delete-cancel", post(cancel_delete))
        .route("/api/projects/:id/expiry", put(set_expiry))
        .route("/api/projects/:id/download", get(download_project))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_identity));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: Config, projects: ProjectStore) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let bind = config.bind.clone();
    let app_state = Arc::new(AppState::new(config, projects));
    let app = router(app_state.clone());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICT_INTERVAL);
        loop {
            ticker.tick().await;
            let dropped = app_state.evict_idle(Instant::now());
            if dropped > 0 {
                info!("dropped {} idle workspaces", dropped);
            }
        }
    });

    let listener = TcpListener::bind(bind.as_str()).await?;
    info!("Listening on http://{}", bind);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn get_workspace(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Json<WorkspaceView> {
    Json(state.read(&session.key, Workspace::view))
}

async fn upload_files(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    mut multipart: Multipart,
) -> Result<Json<WorkspaceView>> {
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| FlashError::InvalidInput(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        // browsers send one empty part when nothing is selected
        let Some(name) = field.file_name().and_then(clean_file_name) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| FlashError::InvalidInput(e.to_string()))?;
        uploads.push(Upload::new(name, bytes.to_vec()));
    }

    let view = state
        .dispatch(&session.key, Event::UploadsChanged(uploads))
        .await?;
    Ok(Json(view))
}

// Keep only the final path component of a client supplied file name
fn clean_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

async fn reset_workspace(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<WorkspaceView>> {
    Ok(Json(state.dispatch(&session.key, Event::Reset).await?))
}

async fn run_snippet(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(req): Json<RunRequest>,
) -> Result<Json<WorkspaceView>> {
    let view = state
        .dispatch(&session.key, Event::SnippetCommitted(req.code))
        .await?;
    Ok(Json(view))
}

async fn figure_html(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let figure = state
        .read(&session.key, |ws| {
            ws.last_run.as_ref().and_then(|r| r.figure.clone())
        })
        .ok_or_else(|| FlashError::NotFound("no figure in the last run".to_string()))?;

    let html = graph::to_html(&figure).map_err(|e| FlashError::Export(e.to_string()))?;
    Ok((
        [(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"figure.html\"",
        )],
        Html(html),
    )
        .into_response())
}

async fn export_combined(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(params): Query<ExportQuery>,
) -> Result<Response> {
    let table = state
        .read(&session.key, Workspace::combined)
        .ok_or_else(|| FlashError::NotFound("no data uploaded".to_string()))?;

    let (body, content_type, filename) = match params.format.as_deref().unwrap_or("csv") {
        "csv" => (
            downloader::to_csv(&table).into_bytes(),
            "text/csv",
            "df_all.csv",
        ),
        "xlsx" => (
            downloader::to_xlsx(&table)?,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "df_all.xlsx",
        ),
        other => {
            return Err(FlashError::InvalidInput(format!(
                "unknown export format '{}'",
                other
            )));
        }
    };

    attachment(body, content_type, filename)
}

async fn toggle_save_form(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(req): Json<SaveFormRequest>,
) -> Result<Json<WorkspaceView>> {
    let event = if req.open {
        Event::SaveFormOpened
    } else {
        Event::SaveFormClosed
    };
    Ok(Json(state.dispatch(&session.key, event).await?))
}

async fn navigate(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(req): Json<PageRequest>,
) -> Result<Json<WorkspaceView>> {
    Ok(Json(
        state.dispatch(&session.key, Event::Navigate(req.page)).await?,
    ))
}

// Snippet and data a save or update should store
fn snapshot(ws: &Workspace) -> Result<(String, crate::table::Registry)> {
    if ws.registry.is_empty() {
        return Err(FlashError::InvalidInput(
            "Upload at least one file before saving.".to_string(),
        ));
    }
    let snippet = ws.snippet.clone().unwrap_or_else(|| ws.editor.clone());
    Ok((snippet, ws.registry.clone()))
}

async fn save_project(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(req): Json<SaveRequest>,
) -> Result<Json<SavedResponse>> {
    let (snippet, registry) = state.read(&session.key, snapshot)?;
    let id = state
        .projects
        .save(&req.author, &req.name, &snippet, &registry, Utc::now())
        .await?;

    let event = Event::ProjectSaved {
        id: id.clone(),
        name: req.name.trim().to_string(),
    };
    let workspace = state.dispatch(&session.key, event).await?;
    Ok(Json(SavedResponse {
        status: "ok".to_string(),
        id,
        workspace,
    }))
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    req: Option<Json<UpdateRequest>>,
) -> Result<Json<SavedResponse>> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let (id, (snippet, registry)) = state.read(&session.key, |ws| {
        let id = ws.loaded_project.clone().ok_or_else(|| {
            FlashError::InvalidInput("No project loaded; save it first.".to_string())
        })?;
        Ok::<_, FlashError>((id, snapshot(ws)?))
    })?;

    let meta = state
        .projects
        .update(
            &id,
            req.author.as_deref(),
            req.name.as_deref(),
            &snippet,
            &registry,
            Utc::now(),
        )
        .await?;

    let event = Event::ProjectSaved {
        id: id.clone(),
        name: meta.name,
    };
    let workspace = state.dispatch(&session.key, event).await?;
    Ok(Json(SavedResponse {
        status: "ok".to_string(),
        id,
        workspace,
    }))
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ProjectSummary>>> {
    let projects = state
        .projects
        .list(&query, Utc::now().date_naive())
        .await?;
    Ok(Json(projects))
}

async fn load_project(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<WorkspaceView>> {
    let archive = state.projects.load(&id).await?;
    let event = Event::ProjectLoaded {
        id,
        snippet: archive.snippet,
        registry: archive.registry,
    };
    Ok(Json(state.dispatch(&session.key, event).await?))
}

async fn request_delete(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<WorkspaceView>> {
    state.projects.meta(&id).await?;
    Ok(Json(
        state
            .dispatch(&session.key, Event::DeleteRequested(id))
            .await?,
    ))
}

async fn cancel_delete(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<WorkspaceView>> {
    Ok(Json(
        state.dispatch(&session.key, Event::DeleteCancelled).await?,
    ))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
    Query(params): Query<DeleteQuery>,
) -> Result<Json<WorkspaceView>> {
    let confirmed = params.confirm
        || state.read(&session.key, |ws| {
            ws.pending_delete.as_deref() == Some(id.as_str())
        });
    if !confirmed {
        return Err(FlashError::InvalidInput(
            "Confirm the deletion first.".to_string(),
        ));
    }

    state.projects.delete(&id).await?;
    Ok(Json(
        state
            .dispatch(&session.key, Event::ProjectDeleted(id))
            .await?,
    ))
}

#[derive(Serialize)]
struct ExpiryResponse {
    #[serde(flatten)]
    meta: ProjectMeta,
    badge: String,
}

async fn set_expiry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExpiryRequest>,
) -> Result<Json<ExpiryResponse>> {
    let expiry = match req.expires_at.as_deref() {
        None => None,
        Some(raw) => Some(Expiry::parse(raw).ok_or_else(|| {
            FlashError::InvalidInput(format!(
                "expires_at must be YYYY-MM-DD or \"never\", got '{}'",
                raw
            ))
        })?),
    };

    let today = Utc::now().date_naive();
    let meta = state.projects.set_expiry(&id, expiry, today).await?;
    let badge = Badge::classify(&meta.expires_at, today).to_string();
    Ok(Json(ExpiryResponse { meta, badge }))
}

async fn download_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    let bytes = state.projects.download(&id).await?;
    attachment(bytes, "application/gzip", &format!("{}.tar.gz", id))
}

fn attachment(body: Vec<u8>, content_type: &str, filename: &str) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from(body))
        .map_err(|e| FlashError::Export(e.to_string()))
}
