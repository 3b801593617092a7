//! HTTP request handlers
//!
//! Thin translation between axum extractors and [`StreamingService`].

use super::client::client_context;
use crate::application::delivery::{MediaResponse, ProgressForm, StreamingService, DEFAULT_POPULAR_LIMIT};
use crate::error::DeliveryError;
use crate::ports::cache::StatusCache;
use crate::ports::repository::{SessionRepository, StatsRepository, TrackRepository};
use crate::ports::storage::ObjectStore;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("x-session-id");
const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000";

/// Shared handler state.
pub type AppState<S, C, R> = Arc<StreamingService<S, C, R>>;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub quality: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PopularQuery {
    pub limit: Option<String>,
}

fn track_id(raw: &str) -> Result<u64, DeliveryError> {
    raw.trim()
        .parse()
        .map_err(|_| DeliveryError::InvalidInput("Invalid track ID".to_string()))
}

/// Health check endpoint
/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": Utc::now().to_rfc3339() }))
}

/// Artifact streaming endpoint
/// GET /stream/:id?quality=<q>
pub async fn stream<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let track_id = track_id(&id)?;
    let context = client_context(&headers, peer);
    let range = headers.get(header::RANGE).and_then(|value| value.to_str().ok());

    let media = service
        .stream(track_id, query.quality.as_deref(), &context, range)
        .await?;
    Ok(media_response(media, true))
}

/// Original upload endpoint
/// GET /stream/:id/download
pub async fn download<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Path(id): Path<String>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let media = service.download(track_id(&id)?).await?;
    Ok(media_response(media, false))
}

/// Preview clip endpoint
/// GET /stream/:id/preview
pub async fn preview<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Path(id): Path<String>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let media = service.preview(track_id(&id)?).await?;
    Ok(media_response(media, true))
}

/// GET /stream/:id/qualities
pub async fn qualities<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Path(id): Path<String>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let qualities = service.qualities(track_id(&id)?).await?;
    Ok(Json(qualities).into_response())
}

/// GET /stream/:id/status
pub async fn track_status<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Path(id): Path<String>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let status = service.track_status(track_id(&id)?).await?;
    Ok(Json(status).into_response())
}

/// GET /stream/popular?limit=<n>
pub async fn popular<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Query(query): Query<PopularQuery>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let limit = query
        .limit
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_POPULAR_LIMIT);
    let tracks = service.popular(limit).await?;
    Ok(Json(json!({ "tracks": tracks })).into_response())
}

/// GET /stream/status?session_id=<id>
pub async fn session_status<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let session_id = query.session_id.unwrap_or_default();
    let view = service.session_status(&session_id).await?;
    Ok(Json(view).into_response())
}

/// GET /stream/progress?session_id=<id>
pub async fn progress<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let session_id = query.session_id.unwrap_or_default();
    let view = service.progress(&session_id).await?;
    Ok(Json(view).into_response())
}

/// POST /stream/progress?session_id=<id>
pub async fn update_progress<S, C, R>(
    State(service): State<AppState<S, C, R>>,
    Query(query): Query<SessionQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Form(form): Form<ProgressForm>,
) -> Result<Response, DeliveryError>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    let session_id = query.session_id.unwrap_or_default();
    let context = client_context(&headers, peer);
    let view = service.update_progress(&session_id, &form, &context).await?;
    Ok(Json(view).into_response())
}

/// Stream an opened object into a response without buffering it.
fn media_response(media: MediaResponse, cacheable: bool) -> Response {
    let MediaResponse {
        body,
        content_type,
        total_size,
        range,
        session_id,
        attachment,
    } = media;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.content_length));
    if cacheable {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE_CACHE_CONTROL));
    }
    if let Some(name) = attachment {
        let disposition = HeaderValue::try_from(format!("attachment; filename=\"{}\"", name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    } else {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if let Some(value) = session_id.and_then(|id| HeaderValue::try_from(id).ok()) {
        headers.insert(SESSION_ID_HEADER, value);
    }

    let status = match range {
        Some(range) => {
            if let Ok(value) = HeaderValue::try_from(range.content_range(total_size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            StatusCode::PARTIAL_CONTENT
        }
        None => StatusCode::OK,
    };

    let stream = ReaderStream::new(body.reader).inspect_err(|err| {
        tracing::warn!(error = %err, "response stream aborted");
    });
    (status, headers, Body::from_stream(stream)).into_response()
}
