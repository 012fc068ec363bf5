use crate::config::ApiConfig;
use crate::error::{ErrorBody, ServiceError};
use crate::export::{ExportEngine, ARCHIVE_FILENAME};
use crate::file_store::{content_type_for, FileStore};
use crate::metadata_store::{BoundingBox, MetadataStore, NewDetection};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub metadata_store: Arc<MetadataStore>,
    pub file_store: Arc<FileStore>,
    pub export_engine: Arc<ExportEngine>,
}

#[derive(Debug, Deserialize)]
pub struct CreateImageRequest {
    pub name: String,
}

/// Detection fields shared by the create and update endpoints.
///
/// All fields are optional at the wire level so an incomplete payload maps
/// to the endpoint's validation failure instead of a generic decode error.
#[derive(Debug, Deserialize)]
pub struct DetectionPayload {
    pub tag_name: Option<String>,
    pub x_min: Option<i32>,
    pub y_min: Option<i32>,
    pub x_max: Option<i32>,
    pub y_max: Option<i32>,
}

impl DetectionPayload {
    fn bbox(&self) -> Option<BoundingBox> {
        Some(BoundingBox {
            x_min: self.x_min?,
            y_min: self.y_min?,
            x_max: self.x_max?,
            y_max: self.y_max?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDetectionRequest {
    pub image_name: Option<String>,
    #[serde(flatten)]
    pub detection: DetectionPayload,
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

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/images", get(list_images).post(create_image))
        .route("/images/:id", get(get_image))
        .route("/image/:name", get(get_image_file).delete(delete_image))
        .route("/detections", post(create_detection))
        .route("/detections/:image_name", get(list_detections))
        .route("/detection/:id", post(update_detection).delete(delete_detection))
        .route("/upload_image", post(upload_image))
        .route("/upload", post(upload))
        .route("/export", get(export))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> &'static str {
    "Welcome to the API"
}

/// Health check with database connectivity and corpus counts
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.metadata_store.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "image-keeper",
                "database": "connected",
                "images": stats.image_count,
                "tags": stats.tag_count,
                "detections": stats.detection_count
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// List all image records
async fn list_images(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let images = state.metadata_store.list_images().await?;
    Ok(Json(images))
}

/// Get a single image record by ID
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let image = state
        .metadata_store
        .get_image(id)
        .await?
        .ok_or(ServiceError::NotFound("Image"))?;
    Ok(Json(image))
}

/// Serve the raw file bytes for an image name
async fn get_image_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let bytes = state
        .file_store
        .read(&name)
        .await?
        .ok_or(ServiceError::NotFound("Image"))?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&name))], bytes))
}

/// Create an image record; the backing file is written by a separate upload
#[instrument(skip(state))]
async fn create_image(
    State(state): State<AppState>,
    Json(request): Json<CreateImageRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    match state.metadata_store.create_image(&request.name).await {
        Ok(image) => Ok((StatusCode::CREATED, Json(image))),
        Err(ServiceError::Conflict(_) | ServiceError::Validation(_)) => Err(
            ServiceError::Conflict("Image could not be created".to_string()),
        ),
        Err(e) => Err(e),
    }
}

/// Delete an image record, its detections (cascade) and its backing file
#[instrument(skip(state))]
async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let image = state
        .metadata_store
        .delete_image(id)
        .await?
        .ok_or(ServiceError::NotFound("Image"))?;

    // A missing file is tolerated; the record is already gone.
    state.file_store.delete(&image.name).await?;

    Ok(Json(json!({ "message": "Image deleted successfully" })))
}

/// Create a detection, creating the image and tag records on first reference
#[instrument(skip(state))]
async fn create_detection(
    State(state): State<AppState>,
    Json(request): Json<CreateDetectionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let created = match (
        request.image_name.as_deref(),
        request.detection.tag_name.as_deref(),
        request.detection.bbox(),
    ) {
        (Some(image_name), Some(tag_name), Some(bbox)) => {
            state
                .metadata_store
                .create_detection(image_name, tag_name, bbox)
                .await
        }
        _ => Err(ServiceError::Validation(
            "Missing detection fields".to_string(),
        )),
    };

    match created {
        Ok(detection) => Ok((StatusCode::CREATED, Json(detection))),
        Err(ServiceError::Conflict(_) | ServiceError::Validation(_)) => Err(
            ServiceError::Conflict("Detection could not be created".to_string()),
        ),
        Err(e) => Err(e),
    }
}

/// Joined detection listing for one image name
async fn list_detections(
    State(state): State<AppState>,
    Path(image_name): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let detections = state
        .metadata_store
        .list_detections_for_image(&image_name)
        .await?
        .ok_or(ServiceError::NotFound("Image"))?;

    Ok(Json(detections))
}

/// Overwrite a detection's tag and box fields
#[instrument(skip(state))]
async fn update_detection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<DetectionPayload>,
) -> Result<impl IntoResponse, ServiceError> {
    let (Some(tag_name), Some(bbox)) = (payload.tag_name.as_deref(), payload.bbox()) else {
        return Err(ServiceError::Validation(
            "Failed to update detection".to_string(),
        ));
    };

    match state.metadata_store.update_detection(id, tag_name, bbox).await {
        Ok(Some(detection)) => Ok(Json(detection)),
        Ok(None) => Err(ServiceError::NotFound("Detection")),
        Err(ServiceError::Validation(_)) => Err(ServiceError::Validation(
            "Failed to update detection".to_string(),
        )),
        Err(e) => Err(e),
    }
}

/// Delete a detection by ID
#[instrument(skip(state))]
async fn delete_detection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    if !state.metadata_store.delete_detection(id).await? {
        return Err(ServiceError::NotFound("Detection"));
    }

    Ok(Json(json!({ "message": "Detection deleted" })))
}

/// Store a raw file in the upload directory, no database interaction
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ServiceError> {
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() == Some("file") {
            let filename = field.file_name().map(String::from);
            let bytes = field.bytes().await.map_err(bad_multipart)?;
            if let Some(filename) = filename {
                file = Some((filename, bytes));
            }
        }
    }

    let Some((filename, bytes)) = file else {
        return Err(ServiceError::BadRequest("No file uploaded".to_string()));
    };

    let filepath = state.file_store.write(&filename, &bytes).await?;
    metrics::counter!("keeper.files.uploaded").increment(1);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "File uploaded successfully",
            "filename": filename,
            "filepath": filepath.display().to_string()
        })),
    ))
}

/// Store a file together with its detections in one request.
///
/// The file write comes first; the image record and all detection rows are
/// then inserted in a single transaction.
#[instrument(skip(state, multipart))]
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ServiceError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut detections_json: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let field_name = field.name().map(String::from);
        match field_name.as_deref() {
            Some("file") => {
                let filename = field.file_name().map(String::from);
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                if let Some(filename) = filename {
                    file = Some((filename, bytes));
                }
            }
            Some("detections") => {
                detections_json = Some(field.text().await.map_err(bad_multipart)?);
            }
            _ => {}
        }
    }

    let (Some((filename, bytes)), Some(detections_json)) = (file, detections_json) else {
        return Err(ServiceError::BadRequest(
            "No file or detections provided".to_string(),
        ));
    };

    let detections: Vec<NewDetection> = serde_json::from_str(&detections_json)
        .map_err(|e| ServiceError::BadRequest(format!("Invalid detections payload: {e}")))?;

    state.file_store.write(&filename, &bytes).await?;
    state
        .metadata_store
        .create_image_with_detections(&filename, &detections)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Image and detections uploaded successfully" })),
    ))
}

/// Export the whole corpus as a ZIP archive
async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let archive = state.export_engine.export_archive().await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{ARCHIVE_FILENAME}\""),
            ),
        ],
        archive,
    ))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "Not found".to_string(),
        }),
    )
}

fn bad_multipart(e: MultipartError) -> ServiceError {
    ServiceError::BadRequest(format!("Invalid multipart request: {e}"))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

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

    #[test]
    fn test_detection_payload_bbox() {
        let complete: DetectionPayload = serde_json::from_str(
            r#"{"tag_name": "cat", "x_min": 1, "y_min": 2, "x_max": 10, "y_max": 20}"#,
        )
        .unwrap();
        let bbox = complete.bbox().unwrap();
        assert_eq!(bbox.x_min, 1);
        assert_eq!(bbox.y_max, 20);

        let partial: DetectionPayload =
            serde_json::from_str(r#"{"tag_name": "cat", "x_min": 1}"#).unwrap();
        assert!(partial.bbox().is_none());
    }

    #[test]
    fn test_create_detection_request_flattens_box_fields() {
        let request: CreateDetectionRequest = serde_json::from_str(
            r#"{"image_name": "a.jpg", "tag_name": "cat",
                "x_min": 1, "y_min": 2, "x_max": 10, "y_max": 20}"#,
        )
        .unwrap();

        assert_eq!(request.image_name.as_deref(), Some("a.jpg"));
        assert_eq!(request.detection.tag_name.as_deref(), Some("cat"));
        assert!(request.detection.bbox().is_some());
    }
}
