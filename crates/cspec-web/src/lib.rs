//! Axum + Askama web UI for viewing and annotating campaign specs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use cspec_core::{
    non_blank, spec_version_filename, CampaignEdit, CampaignRecord, CampaignUpsert,
    NewSpecVersion, NotesEdit, SpecVersion, DEFAULT_STATUS,
};
use cspec_storage::{looks_like_pdf, write_new, PdfStore, RecordStore, StoreError};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cspec-web";

const HISTORY_LIMIT: usize = 5;
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub pdfs: PdfStore,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, pdfs: PdfStore) -> Self {
        Self { store, pdfs }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub pdf_dir: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("CSPEC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            pdf_dir: std::env::var("CSPEC_PDF_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./static")),
        }
    }
}

/// Display-ready campaign row.
#[derive(Debug, Clone)]
struct CampaignView {
    id: i32,
    name: String,
    client: String,
    status: String,
    pdf_filename: String,
    spec_url: String,
    notes: String,
    last_updated: String,
}

impl From<CampaignRecord> for CampaignView {
    fn from(r: CampaignRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            client: r.client,
            status: r.status,
            pdf_filename: r.pdf_filename.unwrap_or_default(),
            spec_url: r.spec_url.unwrap_or_default(),
            notes: r.notes.unwrap_or_default(),
            last_updated: r
                .last_updated
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "n/a".into()),
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryView {
    notes: String,
    edited_by: String,
    edited_at: String,
}

impl From<NotesEdit> for HistoryView {
    fn from(e: NotesEdit) -> Self {
        Self {
            notes: e.notes.unwrap_or_default(),
            edited_by: e.edited_by,
            edited_at: e
                .edited_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "n/a".into()),
        }
    }
}

#[derive(Debug, Clone)]
struct VersionView {
    version: i32,
    filename: String,
    uploaded_by: String,
    uploaded_at: String,
}

impl From<SpecVersion> for VersionView {
    fn from(v: SpecVersion) -> Self {
        Self {
            version: v.version,
            filename: v.filename,
            uploaded_by: v.uploaded_by,
            uploaded_at: v
                .uploaded_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "n/a".into()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    q: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct CampaignForm {
    #[serde(default)]
    name: String,
    #[serde(default)]
    client: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    spec_url: String,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
struct NotesForm {
    #[serde(default)]
    notes: String,
    #[serde(default)]
    edited_by: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct EditForm {
    #[serde(default)]
    name: String,
    #[serde(default)]
    client: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    spec_url: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    edited_by: String,
}

impl From<CampaignRecord> for EditForm {
    fn from(r: CampaignRecord) -> Self {
        Self {
            name: r.name,
            client: r.client,
            status: r.status,
            spec_url: r.spec_url.unwrap_or_default(),
            notes: r.notes.unwrap_or_default(),
            edited_by: String::new(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    campaigns: Vec<CampaignView>,
    query: String,
    total: usize,
}

#[derive(Template)]
#[template(path = "campaign.html")]
struct CampaignTemplate {
    campaign: CampaignView,
    history: Vec<HistoryView>,
    versions: Vec<VersionView>,
}

#[derive(Template)]
#[template(path = "edit_campaign.html")]
struct EditCampaignTemplate {
    id: i32,
    form: EditForm,
    error: String,
    versions: Vec<VersionView>,
}

#[derive(Template)]
#[template(path = "new_campaign.html")]
struct NewCampaignTemplate {
    form: CampaignForm,
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/campaigns", post(create_campaign_handler))
        .route("/campaigns/new", get(new_campaign_handler))
        .route("/campaigns/{id}", get(campaign_detail_handler))
        .route(
            "/campaigns/{id}/edit",
            get(edit_page_handler).post(edit_campaign_handler),
        )
        .route("/campaigns/{id}/notes", post(save_notes_handler))
        .route(
            "/campaigns/{id}/specs",
            post(upload_spec_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/specs/{filename}", get(spec_pdf_handler))
        .route("/api/campaigns", get(api_campaigns_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, store: Arc<dyn RecordStore>) -> anyhow::Result<()> {
    let state = AppState::new(store, PdfStore::new(config.pdf_dir.clone()));
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "serving campaign specs");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn load_campaigns(store: &dyn RecordStore) -> Result<Vec<CampaignRecord>, StoreError> {
    store.list_all().try_collect().await
}

fn matches_query(record: &CampaignRecord, needle: &str) -> bool {
    let fields = [
        Some(record.name.as_str()),
        Some(record.client.as_str()),
        Some(record.status.as_str()),
        record.notes.as_deref(),
        record.spec_url.as_deref(),
        record.pdf_filename.as_deref(),
    ];
    fields
        .into_iter()
        .flatten()
        .any(|f| f.to_lowercase().contains(needle))
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    match load_campaigns(state.store.as_ref()).await {
        Ok(rows) => {
            let total = rows.len();
            let query = query.q.unwrap_or_default().trim().to_string();
            let needle = query.to_lowercase();
            let campaigns = rows
                .into_iter()
                .filter(|r| needle.is_empty() || matches_query(r, &needle))
                .map(CampaignView::from)
                .collect();
            render_html(IndexTemplate {
                campaigns,
                query,
                total,
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn new_campaign_handler() -> Response {
    render_html(NewCampaignTemplate {
        form: CampaignForm {
            status: DEFAULT_STATUS.to_string(),
            ..CampaignForm::default()
        },
        error: String::new(),
    })
}

async fn create_campaign_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CampaignForm>,
) -> Response {
    let mut upsert = CampaignUpsert {
        name: form.name.trim().to_string(),
        client: form.client.trim().to_string(),
        status: non_blank(Some(form.status.as_str())).unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        pdf_filename: None,
        notes: non_blank(Some(form.notes.as_str())),
        spec_url: non_blank(Some(form.spec_url.as_str())),
    };
    if let Err(err) = upsert.validate() {
        let mut resp = render_html(NewCampaignTemplate {
            form,
            error: err.to_string(),
        });
        *resp.status_mut() = StatusCode::UNPROCESSABLE_ENTITY;
        return resp;
    }

    // Re-adding an existing campaign keeps its PDF, and blank fields keep their stored values.
    // Notes only change through `save_notes` so every change lands in the history.
    let form_notes = upsert.notes.take();
    match state.store.find(&upsert.name, &upsert.client).await {
        Ok(Some(existing)) => {
            upsert.pdf_filename = existing.pdf_filename;
            upsert.notes = existing.notes;
            if upsert.spec_url.is_none() {
                upsert.spec_url = existing.spec_url;
            }
        }
        Ok(None) => {}
        Err(err) => return server_error(err.into()),
    }

    let outcome = match state.store.upsert(&upsert).await {
        Ok(outcome) => outcome,
        Err(err) => return server_error(err.into()),
    };
    if form_notes.is_some() && form_notes != upsert.notes {
        if let Err(err) = state
            .store
            .save_notes(outcome.id, form_notes.as_deref(), "user")
            .await
        {
            return server_error(err.into());
        }
    }
    Redirect::to(&format!("/campaigns/{}", outcome.id)).into_response()
}

async fn campaign_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i32>,
) -> Response {
    let campaign = match state.store.get(id).await {
        Ok(Some(campaign)) => campaign,
        Ok(None) => return not_found("Campaign not found"),
        Err(err) => return server_error(err.into()),
    };
    let history = match state.store.notes_history(id, HISTORY_LIMIT).await {
        Ok(history) => history,
        Err(err) => return server_error(err.into()),
    };
    match state.store.spec_versions(id).await {
        Ok(versions) => render_html(CampaignTemplate {
            campaign: campaign.into(),
            history: history.into_iter().map(HistoryView::from).collect(),
            versions: versions.into_iter().map(VersionView::from).collect(),
        }),
        Err(err) => server_error(err.into()),
    }
}

async fn render_edit_page(
    state: &AppState,
    campaign: CampaignRecord,
    form: Option<EditForm>,
    error: String,
    status: StatusCode,
) -> Response {
    let versions = match state.store.spec_versions(campaign.id).await {
        Ok(versions) => versions,
        Err(err) => return server_error(err.into()),
    };
    let id = campaign.id;
    let mut resp = render_html(EditCampaignTemplate {
        id,
        form: form.unwrap_or_else(|| EditForm::from(campaign)),
        error,
        versions: versions.into_iter().map(VersionView::from).collect(),
    });
    *resp.status_mut() = status;
    resp
}

async fn edit_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i32>,
) -> Response {
    match state.store.get(id).await {
        Ok(Some(campaign)) => {
            render_edit_page(&state, campaign, None, String::new(), StatusCode::OK).await
        }
        Ok(None) => not_found("Campaign not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn edit_campaign_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i32>,
    Form(form): Form<EditForm>,
) -> Response {
    let edit = CampaignEdit {
        name: form.name.trim().to_string(),
        client: form.client.trim().to_string(),
        status: non_blank(Some(form.status.as_str())).unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        spec_url: non_blank(Some(form.spec_url.as_str())),
        notes: non_blank(Some(form.notes.as_str())),
        edited_by: non_blank(Some(form.edited_by.as_str())).unwrap_or_else(|| "user".to_string()),
    };
    let (status, error) = match state.store.update(id, &edit).await {
        Ok(true) => return Redirect::to(&format!("/campaigns/{id}")).into_response(),
        Ok(false) => return not_found("Campaign not found"),
        Err(StoreError::Validation(err)) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        Err(StoreError::Conflict(message)) => (StatusCode::CONFLICT, message),
        Err(err) => return server_error(err.into()),
    };
    match state.store.get(id).await {
        Ok(Some(campaign)) => render_edit_page(&state, campaign, Some(form), error, status).await,
        Ok(None) => not_found("Campaign not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn upload_spec_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i32>,
    mut multipart: Multipart,
) -> Response {
    let campaign = match state.store.get(id).await {
        Ok(Some(campaign)) => campaign,
        Ok(None) => return not_found("Campaign not found"),
        Err(err) => return server_error(err.into()),
    };

    let mut body = None;
    let mut uploaded_by = String::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return err.into_response(),
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => match field.bytes().await {
                Ok(bytes) => body = Some(bytes),
                Err(err) => return err.into_response(),
            },
            "uploaded_by" => match field.text().await {
                Ok(text) => uploaded_by = text,
                Err(err) => return err.into_response(),
            },
            _ => {}
        }
    }

    let Some(body) = body.filter(|b| looks_like_pdf(b)) else {
        return render_edit_page(
            &state,
            campaign,
            None,
            "upload must be a PDF file".to_string(),
            StatusCode::UNPROCESSABLE_ENTITY,
        )
        .await;
    };
    let uploaded_by = non_blank(Some(uploaded_by.as_str())).unwrap_or_else(|| "user".to_string());

    match store_spec_version(&state, &campaign, &body, &uploaded_by).await {
        Ok(Upload::Stored(version)) => {
            info!(id, version, %uploaded_by, "spec uploaded");
            Redirect::to(&format!("/campaigns/{id}")).into_response()
        }
        Ok(Upload::Missing) => not_found("Campaign not found"),
        Ok(Upload::Taken(version)) => {
            render_edit_page(
                &state,
                campaign,
                None,
                format!("version {version} was uploaded concurrently; try again"),
                StatusCode::CONFLICT,
            )
            .await
        }
        Err(err) => server_error(err),
    }
}

enum Upload {
    Stored(i32),
    Missing,
    Taken(i32),
}

/// Write the next revision's file, then record it. The file is removed if recording fails.
async fn store_spec_version(
    state: &AppState,
    campaign: &CampaignRecord,
    body: &[u8],
    uploaded_by: &str,
) -> anyhow::Result<Upload> {
    let version = state
        .store
        .spec_versions(campaign.id)
        .await?
        .first()
        .map_or(1, |latest| latest.version + 1);
    let filename = spec_version_filename(&campaign.name, campaign.id, version);
    let path = state
        .pdfs
        .resolve(&filename)
        .with_context(|| format!("unusable spec filename {filename}"))?;
    if write_new(&path, body).await?.is_none() {
        return Ok(Upload::Taken(version));
    }

    let recorded = state
        .store
        .add_spec_version(&NewSpecVersion {
            campaign_id: campaign.id,
            version,
            filename,
            uploaded_by: uploaded_by.to_string(),
        })
        .await;
    if !matches!(recorded, Ok(true)) {
        let _ = tokio::fs::remove_file(&path).await;
    }
    match recorded {
        Ok(true) => Ok(Upload::Stored(version)),
        Ok(false) => Ok(Upload::Missing),
        Err(StoreError::Conflict(_)) => Ok(Upload::Taken(version)),
        Err(err) => Err(err.into()),
    }
}

async fn save_notes_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i32>,
    Form(form): Form<NotesForm>,
) -> Response {
    let notes = non_blank(Some(form.notes.as_str()));
    let editor = non_blank(Some(form.edited_by.as_str())).unwrap_or_else(|| "user".to_string());
    match state.store.save_notes(id, notes.as_deref(), &editor).await {
        Ok(true) => Redirect::to(&format!("/campaigns/{id}")).into_response(),
        Ok(false) => not_found("Campaign not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn spec_pdf_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(filename): AxumPath<String>,
) -> Response {
    let Some(path) = state.pdfs.resolve(&filename) else {
        return not_found("Specification not found");
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{}\"", filename.replace('"', "")),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            not_found("Specification not found")
        }
        Err(err) => server_error(err.into()),
    }
}

async fn api_campaigns_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_campaigns(state.store.as_ref()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(message.to_string())).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("Something went wrong. The error has been logged.".to_string()),
    )
        .into_response()
}
