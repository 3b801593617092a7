//! Axum router configuration

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    download, health, popular, preview, progress, qualities, session_status, stream, track_status,
    update_progress,
};
use crate::application::delivery::StreamingService;
use crate::ports::cache::StatusCache;
use crate::ports::repository::{SessionRepository, StatsRepository, TrackRepository};
use crate::ports::storage::ObjectStore;

/// Create the Axum router with all delivery routes
pub fn create_router<S, C, R>(service: Arc<StreamingService<S, C, R>>) -> Router
where
    S: ObjectStore + 'static,
    C: StatusCache + 'static,
    R: TrackRepository + SessionRepository + StatsRepository + 'static,
{
    // Players fetch ranges cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Static segments take precedence over `:id`
        .route("/stream/popular", get(popular::<S, C, R>))
        .route("/stream/status", get(session_status::<S, C, R>))
        .route(
            "/stream/progress",
            get(progress::<S, C, R>).post(update_progress::<S, C, R>),
        )
        .route("/stream/:id", get(stream::<S, C, R>))
        .route("/stream/:id/download", get(download::<S, C, R>))
        .route("/stream/:id/preview", get(preview::<S, C, R>))
        .route("/stream/:id/qualities", get(qualities::<S, C, R>))
        .route("/stream/:id/status", get(track_status::<S, C, R>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http::handlers::SESSION_ID_HEADER;
    use crate::adapters::memory::{MemoryCache, MemoryObjectStore, MemoryRepository};
    use crate::application::delivery::DeliverySettings;
    use crate::application::stats::StatsRecorder;
    use crate::domain::track::Track;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::response::Response;
    use bytes::Bytes;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn app() -> Router {
        let store = MemoryObjectStore::new();
        let cache = MemoryCache::new();
        let repo = MemoryRepository::new();
        let (stats, _worker) = StatsRecorder::spawn(repo.clone(), 64, CancellationToken::new());

        let track = Track {
            id: 42,
            title: "Intro".into(),
            file_path: "raw/42.wav".into(),
            file_format: "wav".into(),
            duration: 180.0,
            ..Default::default()
        };
        repo.save_track(&track).await.unwrap();
        store.put("audio-tracks", "42/320.mp3", vec![7u8; 1000], Some("audio/mpeg"));
        store.put("audio-originals", "raw/42.wav", b"RIFF".to_vec(), None);

        let settings = DeliverySettings {
            sources_bucket: "audio-originals".into(),
            tracks_bucket: "audio-tracks".into(),
            previews_bucket: "audio-previews".into(),
            default_quality: "320".into(),
        };
        create_router(Arc::new(StreamingService::new(store, cache, repo, stats, settings)))
    }

    async fn fetch(app: Router, uri: &str, range: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri).header(header::USER_AGENT, "curl/8.0");
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ranged_stream() {
        let response = fetch(app().await, "/stream/42", Some("bytes=100-199")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(headers[header::CONTENT_LENGTH], "100");
        assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=31536000");
        assert!(headers.contains_key(SESSION_ID_HEADER));

        let body: Bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, Bytes::from(vec![7u8; 100]));
    }

    #[tokio::test]
    async fn test_full_stream_without_or_with_bad_range() {
        for range in [None, Some("bytes=abc"), Some("bytes=0-1,5-9")] {
            let response = fetch(app().await, "/stream/42", range).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(header::CONTENT_RANGE));
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(body.len(), 1000);
        }
    }

    #[tokio::test]
    async fn test_unknown_quality_falls_back() {
        let response = fetch(app().await, "/stream/42?quality=999", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
    }

    #[tokio::test]
    async fn test_stream_errors_are_json() {
        let bad_id = fetch(app().await, "/stream/abc", None).await;
        assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(bad_id).await["error"], "Invalid track ID");

        let missing = fetch(app().await, "/stream/7", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(missing).await["error"], "Track not found");

        let no_artifact = fetch(app().await, "/stream/42?quality=128", None).await;
        assert_eq!(no_artifact.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(no_artifact).await;
        assert!(!body["error"].as_str().unwrap().contains("42/128.mp3"));
    }

    #[tokio::test]
    async fn test_download() {
        let response = fetch(app().await, "/stream/42/download", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Intro.wav\""
        );
    }

    #[tokio::test]
    async fn test_session_status_requires_id() {
        let response = fetch(app().await, "/stream/status?session_id=", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = fetch(app().await, "/stream/status", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_progress_roundtrip() {
        let app = app().await;
        let streamed = fetch(app.clone(), "/stream/42", None).await;
        let session_id = streamed.headers()[SESSION_ID_HEADER].to_str().unwrap().to_string();

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/stream/progress?session_id={}", session_id))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("position=42.5"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["current_pos"], 42.5);

        let uri = format!("/stream/progress?session_id={}", session_id);
        let response = fetch(app.clone(), &uri, None).await;
        let body = json_body(response).await;
        assert_eq!(body["current_pos"], 42.5);
        assert_eq!(body["is_active"], true);

        let uri = format!("/stream/status?session_id={}", session_id);
        let response = fetch(app, &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["track_id"], 42);
    }

    #[tokio::test]
    async fn test_progress_rejects_bad_position() {
        let app = app().await;
        let streamed = fetch(app.clone(), "/stream/42", None).await;
        let session_id = streamed.headers()[SESSION_ID_HEADER].to_str().unwrap().to_string();

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/stream/progress?session_id={}", session_id))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("position=-4"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reporting_endpoints() {
        let popular = fetch(app().await, "/stream/popular?limit=oops", None).await;
        assert_eq!(popular.status(), StatusCode::OK);
        assert_eq!(json_body(popular).await["tracks"], Value::Array(vec![]));

        let status = fetch(app().await, "/stream/42/status", None).await;
        let body = json_body(status).await;
        assert_eq!(body["processing_status"], "unknown");
        assert_eq!(body["title"], "Intro");

        let qualities = fetch(app().await, "/stream/42/qualities", None).await;
        assert_eq!(json_body(qualities).await["qualities"], serde_json::json!(["320"]));

        let health = fetch(app().await, "/health", None).await;
        assert_eq!(json_body(health).await["status"], "ok");
    }
}
