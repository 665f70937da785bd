use super::{inference_message, inference_status, ErrorBody};
use crate::{image_store::StoreError, inference_service::CAPTION_ERROR, server::SharedState};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

const IMAGE_FIELD: &str = "image";

#[derive(Serialize, Deserialize, Debug)]
pub struct UploadResponse {
    pub image_url: String,
    pub image_id: Uuid,
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No image uploaded")]
    MissingImage,
    #[error("Failed to read upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Failed to store image: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingFile => UploadError::MissingImage,
            other => UploadError::Storage(other),
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            UploadError::MissingImage => (StatusCode::BAD_REQUEST, "No image uploaded"),
            UploadError::Multipart(e) => (e.status(), "Failed to read upload"),
            UploadError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store image"),
        };
        if status != StatusCode::BAD_REQUEST {
            tracing::error!("Upload failed: {}", self);
        }
        (status, Json(ErrorBody { error })).into_response()
    }
}

async fn read_image_field(
    multipart: &mut Multipart,
) -> Result<Option<(Option<String>, Bytes)>, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        // Only file parts count as an upload.
        if field.name() == Some(IMAGE_FIELD) && field.file_name().is_some() {
            let filename = field.file_name().map(str::to_string);
            let bytes = field.bytes().await?;
            return Ok(Some((filename, bytes)));
        }
    }
    Ok(None)
}

#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, UploadError> {
    state.metrics.record_request("/upload");

    let mut multipart = multipart.map_err(|e| {
        tracing::warn!("Rejected upload body: {}", e);
        UploadError::MissingImage
    })?;
    let (filename, bytes) = read_image_field(&mut multipart)
        .await?
        .ok_or(UploadError::MissingImage)?;

    let image = state
        .inference_service
        .images()
        .store(&bytes, filename.as_deref())
        .await?;
    state.metrics.record_upload(bytes.len() as u64);

    let started = Instant::now();
    let result = state.inference_service.caption_stored(&image).await;
    state
        .metrics
        .record_inference_duration(started.elapsed().as_millis() as u64, "caption");

    let (status, caption, error) = match result {
        Ok(caption) => (StatusCode::OK, caption, None),
        Err(e) => {
            state.metrics.record_inference_failure("caption", e.kind());
            (
                inference_status(&e),
                CAPTION_ERROR.to_string(),
                Some(inference_message(&e).to_string()),
            )
        }
    };

    let response = UploadResponse {
        image_url: image.public_url,
        image_id: image.id,
        caption,
        error,
    };
    Ok((status, Json(response)).into_response())
}
