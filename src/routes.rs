use axum::{
    body::Bytes,
    extract::{FromRequest, FromRequestParts, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::StoryError,
    export::{download_filename, ExportFormat},
    invest::{score_story, InvestReport, Suggestion},
    models::{Section, StoryRecord, StoryRequest, StoryVersion},
    prompt::build_story_prompt,
    service::{self, StoryEdit, StoryService, VersionDiff},
    session::SessionStore,
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub service: Arc<StoryService>,
}

/// `Json` whose rejections render as a `ValidationError` body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(StoryError))]
pub struct AppJson<T>(pub T);

/// `Path` whose rejections render as a `ValidationError` body.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(StoryError))]
pub struct AppPath<T>(pub T);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:sid", delete(close_session))
        .route("/api/sessions/:sid/reset", post(reset_session))
        .route("/api/sessions/:sid/cancel", post(cancel_generation))
        .route("/api/sessions/:sid/export/:format", get(export_session))
        .route("/api/sessions/:sid/stories", post(create_story).get(list_stories))
        .route("/api/sessions/:sid/stories/:id", get(get_story).put(edit_story).delete(delete_story))
        .route("/api/sessions/:sid/stories/:id/export/:format", get(export_story))
        .route("/api/sessions/:sid/stories/:id/sections/:section/regenerate", post(regenerate_section))
        .route("/api/sessions/:sid/stories/:id/versions", get(list_versions))
        .route("/api/sessions/:sid/stories/:id/versions/:n/restore", post(restore_version))
        .route("/api/sessions/:sid/stories/:id/versions/:n/note", put(annotate_version))
        .route("/api/sessions/:sid/stories/:id/versions/:n/diff/:other", get(diff_versions))
        .route("/api/sessions/:sid/stories/:id/invest", get(invest_score))
        .route("/api/sessions/:sid/stories/:id/invest/review", post(invest_review))
        .route("/api/sessions/:sid/stories/:id/suggestions", post(suggest_improvements))
        .route("/api/prompt/preview", post(preview_prompt))
        .with_state(state)
}

pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let id = state.sessions.create();
    (StatusCode::CREATED, Json(json!({ "id": id })))
}

pub async fn close_session(AppPath(sid): AppPath<Uuid>, State(state): State<AppState>) -> Result<Json<Value>, StoryError> {
    let dropped = state.sessions.close(sid)?;
    Ok(Json(json!({ "id": sid, "droppedStories": dropped })))
}

pub async fn reset_session(AppPath(sid): AppPath<Uuid>, State(state): State<AppState>) -> Result<Json<Value>, StoryError> {
    let dropped = state.sessions.reset(sid)?;
    Ok(Json(json!({ "id": sid, "droppedStories": dropped })))
}

pub async fn cancel_generation(AppPath(sid): AppPath<Uuid>, State(state): State<AppState>) -> Result<Json<Value>, StoryError> {
    let cancelled = state.sessions.cancel(sid)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

#[axum::debug_handler]
pub async fn create_story(
    AppPath(sid): AppPath<Uuid>,
    State(state): State<AppState>,
    AppJson(body): AppJson<StoryRequest>,
) -> Result<(StatusCode, Json<StoryRecord>), StoryError> {
    // held until return; dropping the future on disconnect frees the slot too
    let ticket = state.sessions.begin_generation(sid)?;
    let record = state.service.create_story(body, ticket.token()).await?;

    ticket.insert_story(record.clone())?;
    tracing::info!("✅ Stored story {} in session {}", record.id, sid);
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_stories(AppPath(sid): AppPath<Uuid>, State(state): State<AppState>) -> Result<Json<Vec<StoryRecord>>, StoryError> {
    Ok(Json(state.sessions.list_stories(sid)?))
}

pub async fn get_story(
    AppPath((sid, id)): AppPath<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<StoryRecord>, StoryError> {
    Ok(Json(state.sessions.get_story(sid, id)?))
}

pub async fn edit_story(
    AppPath((sid, id)): AppPath<(Uuid, Uuid)>,
    State(state): State<AppState>,
    AppJson(edit): AppJson<StoryEdit>,
) -> Result<Json<StoryRecord>, StoryError> {
    let ticket = state.sessions.begin_generation(sid)?;
    let updated = ticket.update_story(id, move |r| {
        service::apply_edit(r, edit)?;
        Ok(r.clone())
    })?;
    Ok(Json(updated))
}

pub async fn delete_story(AppPath((sid, id)): AppPath<(Uuid, Uuid)>, State(state): State<AppState>) -> Result<StatusCode, StoryError> {
    state.sessions.delete_story(sid, id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn attachment(format: ExportFormat, filename: &str, bytes: Bytes) -> Result<Response, StoryError> {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .map_err(|e| StoryError::Export(e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(format.mime_type())),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

pub async fn export_story(
    AppPath((sid, id, format)): AppPath<(Uuid, Uuid, String)>,
    State(state): State<AppState>,
) -> Result<Response, StoryError> {
    let format: ExportFormat = format.parse()?;
    let record = state.sessions.get_story(sid, id)?;
    let bytes = format.render(&record)?;

    let filename = download_filename(&record.story.title, format, Utc::now());
    tracing::info!("📄 Exported story {} as {}", id, filename);
    attachment(format, &filename, bytes)
}

pub async fn export_session(
    AppPath((sid, format)): AppPath<(Uuid, String)>,
    State(state): State<AppState>,
) -> Result<Response, StoryError> {
    let format: ExportFormat = format.parse()?;
    let records = state.sessions.list_stories(sid)?;
    let bytes = format.render_all(&records)?;

    let filename = download_filename("stories", format, Utc::now());
    tracing::info!("📦 Exported {} stories of session {} as {}", records.len(), sid, filename);
    attachment(format, &filename, bytes)
}

#[axum::debug_handler]
pub async fn regenerate_section(
    AppPath((sid, id, section)): AppPath<(Uuid, Uuid, String)>,
    State(state): State<AppState>,
) -> Result<Json<StoryRecord>, StoryError> {
    let section = Section::from_key(&section).ok_or(StoryError::UnknownSection(section))?;
    let ticket = state.sessions.begin_generation(sid)?;
    // Snapshot under the slot; the provider call runs without any lock held
    let record = state.sessions.get_story(sid, id)?;
    let regenerated = state.service.regenerate_section(&record, section, ticket.token()).await?;

    let updated = ticket.update_story(id, move |r| {
        r.push_version(regenerated.story, regenerated.warnings, regenerated.summary);
        Ok(r.clone())
    })?;
    Ok(Json(updated))
}

pub async fn list_versions(
    AppPath((sid, id)): AppPath<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<Vec<StoryVersion>>, StoryError> {
    Ok(Json(state.sessions.get_story(sid, id)?.versions))
}

pub async fn restore_version(
    AppPath((sid, id, n)): AppPath<(Uuid, Uuid, u32)>,
    State(state): State<AppState>,
) -> Result<Json<StoryRecord>, StoryError> {
    let ticket = state.sessions.begin_generation(sid)?;
    let updated = ticket.update_story(id, |r| {
        service::restore_version(r, n)?;
        Ok(r.clone())
    })?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct NoteBody {
    #[serde(default)]
    note: String,
}

pub async fn annotate_version(
    AppPath((sid, id, n)): AppPath<(Uuid, Uuid, u32)>,
    State(state): State<AppState>,
    AppJson(body): AppJson<NoteBody>,
) -> Result<Json<StoryVersion>, StoryError> {
    let version = state.sessions.update_story(sid, id, |r| service::annotate_version(r, n, &body.note))?;
    Ok(Json(version))
}

pub async fn diff_versions(
    AppPath((sid, id, n, other)): AppPath<(Uuid, Uuid, u32, u32)>,
    State(state): State<AppState>,
) -> Result<Json<VersionDiff>, StoryError> {
    let record = state.sessions.get_story(sid, id)?;
    Ok(Json(service::compare_versions(&record, n, other)?))
}

pub async fn invest_score(
    AppPath((sid, id)): AppPath<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<InvestReport>, StoryError> {
    let record = state.sessions.get_story(sid, id)?;
    Ok(Json(score_story(&record)))
}

#[axum::debug_handler]
pub async fn invest_review(
    AppPath((sid, id)): AppPath<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<InvestReport>, StoryError> {
    let ticket = state.sessions.begin_generation(sid)?;
    let record = state.sessions.get_story(sid, id)?;
    Ok(Json(state.service.review_invest(&record, ticket.token()).await?))
}

#[axum::debug_handler]
pub async fn suggest_improvements(
    AppPath((sid, id)): AppPath<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Suggestion>>, StoryError> {
    let ticket = state.sessions.begin_generation(sid)?;
    let record = state.sessions.get_story(sid, id)?;
    Ok(Json(state.service.suggest_improvements(&record, ticket.token()).await?))
}

pub async fn preview_prompt(AppJson(body): AppJson<StoryRequest>) -> Result<Json<Value>, StoryError> {
    let prompt = build_story_prompt(&body)?;
    Ok(Json(json!({ "prompt": prompt })))
}
