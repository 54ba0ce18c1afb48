//! REST surface. Image and video uploads are raw request bodies; everything
//! else is JSON.

use crate::engine::{EngineError, EngineHandle};
use crate::store::{SessionOrdering, SessionQuery};
use atrium_core::storage::content_type;
use atrium_core::video::VideoError;
use atrium_core::{IdentityKind, RegistryError, StorageError, StoreError, VisitorSession};
use atrium_io::SignedUrlParams;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

pub fn router(engine: EngineHandle, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/api/ai/face/enroll", post(face_enroll))
        .route("/api/ai/face/login", post(face_login))
        .route("/api/ai/face/status/:user_id", get(face_status))
        .route("/api/ai/face/revoke", post(face_revoke))
        .route("/api/ai/face/debug", get(face_debug))
        .route("/api/ai/visitor/login", post(visitor_login))
        .route("/api/ai/visitor/logout", post(visitor_logout))
        .route("/api/ai/visitor/status/:user_id", get(visitor_status))
        .route("/api/ai/visitor/sessions", get(visitor_sessions))
        .route("/api/ai/visitor/sessions/stats", get(visitor_stats))
        .route("/api/ai/plates/detect", post(plate_detect))
        .route("/api/ai/plates/assign", post(plate_assign))
        .route("/api/ai/plates/verify", post(plate_verify))
        .route("/api/ai/video/upload-and-process", post(video_upload))
        .route("/api/ai/alerts", get(alerts))
        .route("/api/ai/media/url", get(media_url))
        .route("/media/:bucket/*key", get(media))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(engine)
}

/// Engine error rendered as `{"ok": false, "error": ...}` with a mapped status.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

fn storage_status(e: &StorageError) -> StatusCode {
    match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        StorageError::Backend(_) | StorageError::Io(_) => StatusCode::BAD_GATEWAY,
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Registry(RegistryError::Configuration(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Registry(RegistryError::Provider(_)) => StatusCode::BAD_GATEWAY,
        EngineError::Registry(RegistryError::Storage(e)) => storage_status(e),
        EngineError::Registry(RegistryError::Store(e)) => store_status(e),
        EngineError::Plate(_) => StatusCode::BAD_GATEWAY,
        EngineError::Video(VideoError::JobFailed { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Video(VideoError::Cancelled { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Video(VideoError::DeadlineExceeded { .. }) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Video(VideoError::Storage(e)) => storage_status(e),
        EngineError::Video(VideoError::Provider(_)) => StatusCode::BAD_GATEWAY,
        EngineError::Store(e) => store_status(e),
        EngineError::Storage(e) => storage_status(e),
        EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
        EngineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Spawn(_) | EngineError::Join(_) | EngineError::ChannelClosed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        (status, Json(json!({ "ok": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(EngineError::BadRequest(msg.into()))
}

fn require_body(body: Bytes, what: &str) -> ApiResult<Vec<u8>> {
    if body.is_empty() {
        return Err(bad_request(format!("{what} body is empty")));
    }
    Ok(body.to_vec())
}

fn kind_of(visitor: bool) -> IdentityKind {
    if visitor {
        IdentityKind::Visitor
    } else {
        IdentityKind::Regular
    }
}

async fn status(State(engine): State<EngineHandle>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(engine.status().await?))
}

// --- faces --------------------------------------------------------------

#[derive(Deserialize)]
struct EnrollParams {
    user_id: i64,
    #[serde(default)]
    visitor: bool,
}

async fn face_enroll(
    State(engine): State<EngineHandle>,
    Query(params): Query<EnrollParams>,
    body: Bytes,
) -> ApiResult<Response> {
    let image = require_body(body, "image")?;
    let outcome = engine
        .enroll(params.user_id, image, kind_of(params.visitor))
        .await?;
    let status = if outcome.persisted() {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(json!({ "ok": true, "enrollment": outcome }))).into_response())
}

#[derive(Deserialize, Default)]
struct LoginParams {
    #[serde(default)]
    visitor: bool,
}

async fn face_login(
    State(engine): State<EngineHandle>,
    Query(params): Query<LoginParams>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let image = require_body(body, "image")?;
    let login = engine.face_login(image, kind_of(params.visitor)).await?;
    Ok(Json(json!({
        "ok": true,
        "matched": login.identity.is_some(),
        "user_id": login.identity.as_ref().map(|i| i.user_id),
        "login": login,
    })))
}

async fn face_status(
    State(engine): State<EngineHandle>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let identity = engine
        .face_status(user_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::NotFound(format!("user {user_id} is not enrolled"))))?;
    Ok(Json(json!({ "ok": true, "identity": identity })))
}

#[derive(Deserialize)]
struct RevokeBody {
    user_id: i64,
    #[serde(default)]
    purge: bool,
}

async fn face_revoke(
    State(engine): State<EngineHandle>,
    Json(body): Json<RevokeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !engine.revoke(body.user_id, body.purge).await? {
        return Err(ApiError(EngineError::NotFound(format!(
            "user {} is not enrolled",
            body.user_id
        ))));
    }
    Ok(Json(json!({ "ok": true, "purged": body.purge })))
}

async fn face_debug(State(engine): State<EngineHandle>) -> ApiResult<Json<serde_json::Value>> {
    let listing = engine.face_debug().await?;
    Ok(Json(json!({
        "ok": true,
        "collection": listing.collection,
        "count": listing.count,
        "faces": listing.faces,
    })))
}

// --- visitors -----------------------------------------------------------

async fn visitor_login(
    State(engine): State<EngineHandle>,
    body: Bytes,
) -> ApiResult<Response> {
    let image = require_body(body, "image")?;
    let (identity, session) = engine.visitor_login(image).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "user_id": identity.user_id, "session": session })),
    )
        .into_response())
}

#[derive(Deserialize)]
struct UserBody {
    user_id: i64,
}

async fn visitor_logout(
    State(engine): State<EngineHandle>,
    Json(body): Json<UserBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = engine.visitor_logout(body.user_id).await?;
    Ok(Json(json!({ "ok": true, "session": session })))
}

/// `{"last_event": "login" | "logout" | null, "at": ...}` for the latest session.
fn last_event(session: Option<&VisitorSession>) -> serde_json::Value {
    match session {
        Some(s) => match s.logout_at {
            Some(at) => json!({ "last_event": "logout", "at": at }),
            None => json!({ "last_event": "login", "at": s.login_at }),
        },
        None => json!({ "last_event": null, "at": null }),
    }
}

async fn visitor_status(
    State(engine): State<EngineHandle>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = engine.visitor_status(user_id).await?;
    Ok(Json(last_event(session.as_ref())))
}

#[derive(Deserialize, Default)]
struct SessionParams {
    user_id: Option<i64>,
    from: Option<String>,
    to: Option<String>,
    ordering: Option<String>,
    limit: Option<u32>,
}

fn parse_day(raw: Option<&str>, name: &str) -> ApiResult<Option<NaiveDate>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| bad_request(format!("{name} must be YYYY-MM-DD, got {s:?}"))),
    }
}

impl SessionParams {
    fn into_query(self) -> ApiResult<SessionQuery> {
        let ordering = match self.ordering.as_deref() {
            None | Some("") => SessionOrdering::default(),
            Some(raw) => raw.parse().map_err(bad_request)?,
        };
        Ok(SessionQuery {
            user_id: self.user_id,
            from: parse_day(self.from.as_deref(), "from")?,
            to: parse_day(self.to.as_deref(), "to")?,
            ordering,
            limit: self.limit.unwrap_or(0),
        })
    }
}

async fn visitor_sessions(
    State(engine): State<EngineHandle>,
    Query(params): Query<SessionParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let sessions = engine.sessions(params.into_query()?).await?;
    Ok(Json(json!({ "ok": true, "count": sessions.len(), "sessions": sessions })))
}

async fn visitor_stats(State(engine): State<EngineHandle>) -> ApiResult<Json<serde_json::Value>> {
    let stats = engine.session_stats().await?;
    Ok(Json(json!({ "ok": true, "stats": stats })))
}

// --- plates -------------------------------------------------------------

async fn plate_detect(
    State(engine): State<EngineHandle>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let image = require_body(body, "image")?;
    let reading = engine.detect_plate(image).await?;
    Ok(Json(json!({
        "ok": true,
        "plate": reading.plate,
        "storage_key": reading.storage_key,
    })))
}

#[derive(Deserialize)]
struct AssignBody {
    user_id: i64,
    number: String,
}

async fn plate_assign(
    State(engine): State<EngineHandle>,
    Json(body): Json<AssignBody>,
) -> ApiResult<Response> {
    if body.number.trim().is_empty() {
        return Err(bad_request("number is required"));
    }
    let plate = engine.assign_plate(body.user_id, body.number).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "id": plate.id, "number": plate.number })),
    )
        .into_response())
}

#[derive(Deserialize)]
struct VerifyBody {
    number: String,
}

async fn plate_verify(
    State(engine): State<EngineHandle>,
    Json(body): Json<VerifyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let exists = engine.verify_plate(body.number).await?;
    Ok(Json(json!({ "exists": exists })))
}

// --- video and alerts ---------------------------------------------------

#[derive(Deserialize, Default)]
struct VideoParams {
    camera_id: Option<String>,
    ext: Option<String>,
}

/// Normalize an upload extension to `.xyz`; defaults to `.mp4`.
fn video_extension(raw: Option<&str>) -> ApiResult<String> {
    let ext = raw.map(str::trim).unwrap_or("").trim_start_matches('.');
    if ext.is_empty() {
        return Ok(".mp4".into());
    }
    if ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(bad_request(format!("unsupported extension {ext:?}")));
    }
    Ok(format!(".{}", ext.to_ascii_lowercase()))
}

async fn video_upload(
    State(engine): State<EngineHandle>,
    Query(params): Query<VideoParams>,
    body: Bytes,
) -> ApiResult<Response> {
    let video = require_body(body, "video")?;
    let ext = video_extension(params.ext.as_deref())?;
    let camera_id = params.camera_id.filter(|c| !c.trim().is_empty());

    let outcome = engine.process_video(video, ext, camera_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "video_key": outcome.video_key,
            "events": outcome.alerts,
        })),
    )
        .into_response())
}

async fn alerts(State(engine): State<EngineHandle>) -> ApiResult<Json<serde_json::Value>> {
    let alerts = engine.alerts().await?;
    Ok(Json(json!({ "ok": true, "alerts": alerts })))
}

// --- media --------------------------------------------------------------

#[derive(Deserialize)]
struct MediaUrlParams {
    key: String,
}

async fn media_url(
    State(engine): State<EngineHandle>,
    Query(params): Query<MediaUrlParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let url = engine.media_url(&params.key)?;
    Ok(Json(json!({ "ok": true, "url": url })))
}

async fn media(
    State(engine): State<EngineHandle>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<SignedUrlParams>,
) -> ApiResult<Response> {
    let bytes = engine.read_signed(bucket, key.clone(), params).await?;
    Ok(([(header::CONTENT_TYPE, content_type(&key))], bytes).into_response())
}
