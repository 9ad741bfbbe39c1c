//! HTTP query and device-control API.
//!
//! The photo query endpoint translates epoch-second bounds and optional
//! text/device filters into a store query, then decorates every hit with a
//! freshly presigned retrieval URL. Presigning is all-or-nothing: a single
//! failure aborts the response rather than silently omitting rows from a
//! monitoring view.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::archive::{archive_key, PhotoArchive};
use crate::config::ApiConfig;
use crate::device_registry::{Device, DeviceRegistry, RegistryError};
use crate::mqtt_consumer::DeviceCommander;
use crate::photo_store::{PhotoQuery, PhotoRepository};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub devices: Arc<dyn DeviceRegistry>,
    pub photos: Arc<dyn PhotoRepository>,
    pub archive: Arc<dyn PhotoArchive>,
    pub commander: Arc<dyn DeviceCommander>,
    pub storage_prefix: String,
    pub presign_ttl: Duration,
    pub auth_token: Option<String>,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            code: "INVALID_INPUT".to_string(),
        }),
    )
}

fn internal_error(message: impl Into<String>, code: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

/// Raw query parameters for the photo list endpoint. `start` and `end` stay
/// strings here so malformed values surface as client errors instead of
/// deserialization rejections with no body.
#[derive(Debug, Deserialize)]
pub struct PhotoListParams {
    /// Inclusive start, integer epoch seconds
    pub start: Option<String>,
    /// Inclusive end, integer epoch seconds
    pub end: Option<String>,
    /// Case-insensitive substring filter on extracted text
    pub text: Option<String>,
    /// Exact device filter
    pub device_id: Option<String>,
}

/// Photo in API responses, decorated with a presigned retrieval URL.
#[derive(Debug, Serialize)]
pub struct PhotoResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub image_type: String,
    pub device_id: Option<String>,
    pub text: String,
    pub presigned_url: String,
}

fn parse_epoch_param(name: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| bad_request(format!("Invalid {} timestamp: {}", name, value)))
}

/// Resolve the query window: explicit bounds must parse as epoch seconds;
/// omitted bounds fall back to a rolling 24-hour window ending now.
fn resolve_time_range(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let start = match start {
        Some(value) => parse_epoch_param("start", value)?,
        None => now - ChronoDuration::hours(24),
    };
    let end = match end {
        Some(value) => parse_epoch_param("end", value)?,
        None => now,
    };
    Ok((start, end))
}

/// Execute the photo query and presign every result.
async fn run_photo_query(
    state: &AppState,
    params: PhotoListParams,
    now: DateTime<Utc>,
) -> Result<Vec<PhotoResponse>, ApiError> {
    let (start, end) = resolve_time_range(params.start.as_deref(), params.end.as_deref(), now)?;

    let query = PhotoQuery {
        start,
        end,
        text: params.text,
        device_id: params.device_id,
    };

    let photos = state.photos.query(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query photos");
        internal_error("Failed to query photos", "QUERY_ERROR")
    })?;

    let mut responses = Vec::with_capacity(photos.len());

    for photo in photos {
        // Same derivation as the ingestion write path
        let key = archive_key(&state.storage_prefix, photo.timestamp, &photo.image_type);

        let presigned_url = state
            .archive
            .presign(&key, state.presign_ttl)
            .await
            .map_err(|e| {
                error!(error = %e, key = %key, "Failed to presign photo URL");
                internal_error("Failed to generate presigned URL", "PRESIGN_ERROR")
            })?;

        responses.push(PhotoResponse {
            id: photo.id,
            timestamp: photo.timestamp,
            image_type: photo.image_type,
            device_id: photo.device_id,
            text: photo.text,
            presigned_url,
        });
    }

    Ok(responses)
}

/// List photos in a time window with optional filters
#[instrument(skip(state))]
async fn list_photos(
    State(state): State<AppState>,
    Query(params): Query<PhotoListParams>,
) -> Result<Json<Vec<PhotoResponse>>, ApiError> {
    let responses = run_photo_query(&state, params, Utc::now()).await?;
    Ok(Json(responses))
}

/// List registered devices
#[instrument(skip(state))]
async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    state.devices.list().await.map(Json).map_err(|e| {
        error!(error = %e, "Failed to list devices");
        internal_error("Failed to list devices", "QUERY_ERROR")
    })
}

/// Mode-change request body
#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
}

/// Mode-change acknowledgment
#[derive(Debug, Serialize)]
pub struct SetModeResponse {
    pub device_id: String,
    pub mode: String,
}

/// Publish a mode command to a registered device's setup topic
#[instrument(skip(state))]
async fn set_device_mode(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<SetModeRequest>,
) -> Result<(StatusCode, Json<SetModeResponse>), ApiError> {
    let mode = request.mode.trim();
    if mode.is_empty() || mode.contains(char::is_whitespace) {
        return Err(bad_request("Mode must be a single non-empty token"));
    }

    match state.devices.get(&device_id).await {
        Ok(_) => {}
        Err(RegistryError::NotFound(_)) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("Device not found: {}", device_id),
                    code: "NOT_FOUND".to_string(),
                }),
            ));
        }
        Err(e) => {
            error!(error = %e, "Failed to look up device");
            return Err(internal_error("Failed to look up device", "QUERY_ERROR"));
        }
    }

    state
        .commander
        .send_mode(&device_id, mode)
        .await
        .map_err(|e| {
            error!(error = %e, device_id = %device_id, "Failed to publish mode command");
            internal_error("Failed to publish mode command", "PUBLISH_ERROR")
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SetModeResponse {
            device_id,
            mode: mode.to_string(),
        }),
    ))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photosink"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.photos.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

fn bearer_token_matches(header_value: Option<&str>, expected: &str) -> bool {
    header_value
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

/// Require the configured bearer token on protected routes; pass-through
/// when no token is configured.
async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(ref expected) = state.auth_token else {
        return next.run(request).await;
    };

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if bearer_token_matches(header_value, expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Missing or invalid bearer token".to_string(),
                code: "UNAUTHORIZED".to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let protected = Router::new()
        .route("/api/v1/photos", get(list_photos))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id/mode", post(set_device_mode))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting query API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InMemoryPhotoArchive;
    use crate::device_registry::InMemoryDeviceRegistry;
    use crate::mqtt_consumer::MockDeviceCommander;
    use crate::photo_store::{InMemoryPhotoStore, NewPhoto};
    use chrono::TimeZone;

    fn state_with(
        photos: Arc<InMemoryPhotoStore>,
        archive: Arc<InMemoryPhotoArchive>,
    ) -> AppState {
        AppState {
            devices: Arc::new(InMemoryDeviceRegistry::new()),
            photos,
            archive,
            commander: Arc::new(MockDeviceCommander::new()),
            storage_prefix: "photos".to_string(),
            presign_ttl: Duration::from_secs(900),
            auth_token: None,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_resolve_time_range_defaults_to_24h_window() {
        let now = ts(1_700_000_000);
        let (start, end) = resolve_time_range(None, None, now).unwrap();
        assert_eq!(end, now);
        assert_eq!(start, now - ChronoDuration::hours(24));
    }

    #[test]
    fn test_resolve_time_range_parses_epoch_seconds() {
        let now = ts(2_000_000_000);
        let (start, end) =
            resolve_time_range(Some("1000"), Some("2000"), now).unwrap();
        assert_eq!(start, ts(1000));
        assert_eq!(end, ts(2000));
    }

    #[test]
    fn test_malformed_start_is_client_error_not_default_window() {
        let now = ts(1_700_000_000);
        let err = resolve_time_range(Some("yesterday"), None, now).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = resolve_time_range(Some("12.5"), None, now).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_bearer_token_matches() {
        assert!(bearer_token_matches(Some("Bearer s3cret"), "s3cret"));
        assert!(!bearer_token_matches(Some("Bearer wrong"), "s3cret"));
        assert!(!bearer_token_matches(Some("s3cret"), "s3cret"));
        assert!(!bearer_token_matches(None, "s3cret"));
    }

    #[tokio::test]
    async fn test_query_decorates_results_with_presigned_urls() {
        let photos = Arc::new(InMemoryPhotoStore::new());
        let archive = Arc::new(InMemoryPhotoArchive::new());

        let photo = photos
            .insert(NewPhoto {
                timestamp: ts(5000),
                image_type: "jpeg".to_string(),
                device_id: Some("cam-1".to_string()),
                text: "hello".to_string(),
            })
            .await
            .unwrap();
        archive
            .put("photos/5000.jpeg", &[1, 2, 3], "image/jpeg")
            .await
            .unwrap();

        let state = state_with(photos, archive);
        let params = PhotoListParams {
            start: Some("4000".to_string()),
            end: Some("6000".to_string()),
            text: None,
            device_id: None,
        };

        let responses = run_photo_query(&state, params, ts(6000)).await.unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, photo.id);
        assert!(responses[0].presigned_url.starts_with("memory://photos/5000.jpeg"));
    }

    #[tokio::test]
    async fn test_single_presign_failure_aborts_whole_response() {
        let photos = Arc::new(InMemoryPhotoStore::new());
        let archive = Arc::new(InMemoryPhotoArchive::new());

        // Two records; only one has a backing object, so presigning the
        // other fails and no partial result may be returned.
        photos
            .insert(NewPhoto {
                timestamp: ts(5000),
                image_type: "jpeg".to_string(),
                device_id: None,
                text: "a".to_string(),
            })
            .await
            .unwrap();
        photos
            .insert(NewPhoto {
                timestamp: ts(5001),
                image_type: "jpeg".to_string(),
                device_id: None,
                text: "b".to_string(),
            })
            .await
            .unwrap();
        archive
            .put("photos/5000.jpeg", &[1], "image/jpeg")
            .await
            .unwrap();

        let state = state_with(photos, archive);
        let params = PhotoListParams {
            start: Some("4000".to_string()),
            end: Some("6000".to_string()),
            text: None,
            device_id: None,
        };

        let err = run_photo_query(&state, params, ts(6000)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.1.code, "PRESIGN_ERROR");
    }

    #[tokio::test]
    async fn test_set_mode_unknown_device_is_404() {
        let state = state_with(
            Arc::new(InMemoryPhotoStore::new()),
            Arc::new(InMemoryPhotoArchive::new()),
        );

        let result = set_device_mode(
            State(state),
            Path("ghost".to_string()),
            Json(SetModeRequest {
                mode: "live".to_string(),
            }),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_mode_publishes_command_for_known_device() {
        let devices = Arc::new(InMemoryDeviceRegistry::new());
        devices.register_or_update("cam-1", "cam").await.unwrap();

        let mut commander = MockDeviceCommander::new();
        commander
            .expect_send_mode()
            .withf(|device_id, mode| device_id == "cam-1" && mode == "live")
            .times(1)
            .returning(|_, _| Ok(()));

        let state = AppState {
            devices,
            photos: Arc::new(InMemoryPhotoStore::new()),
            archive: Arc::new(InMemoryPhotoArchive::new()),
            commander: Arc::new(commander),
            storage_prefix: "photos".to_string(),
            presign_ttl: Duration::from_secs(900),
            auth_token: None,
        };

        let (status, body) = set_device_mode(
            State(state),
            Path("cam-1".to_string()),
            Json(SetModeRequest {
                mode: "live".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.mode, "live");
    }

    #[tokio::test]
    async fn test_set_mode_rejects_multi_token_mode() {
        let state = state_with(
            Arc::new(InMemoryPhotoStore::new()),
            Arc::new(InMemoryPhotoArchive::new()),
        );

        let err = set_device_mode(
            State(state),
            Path("cam-1".to_string()),
            Json(SetModeRequest {
                mode: "live; rm -rf".to_string(),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
