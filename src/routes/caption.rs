use super::{form_or_json, inference_message, inference_status, non_blank, ErrorBody};
use crate::{inference_service::CAPTION_ERROR, server::SharedState};
use axum::{
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::instrument;

#[derive(Deserialize, Default)]
#[serde(default)]
struct CaptionFields {
    image: String,
}

/// Re-captions an image that was uploaded earlier.
#[derive(Debug)]
pub struct CaptionRequest {
    pub image: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CaptionResponse {
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct MissingImage;

impl IntoResponse for MissingImage {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: "No image provided",
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

impl<S> FromRequest<S> for CaptionRequest
where
    S: Send + Sync,
{
    type Rejection = MissingImage;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let fields: CaptionFields = form_or_json(req, state).await;
        non_blank(fields.image)
            .map(|image| Self { image })
            .ok_or(MissingImage)
    }
}

#[instrument(skip(state))]
pub async fn caption_image(
    State(state): State<SharedState>,
    request: CaptionRequest,
) -> Response {
    state.metrics.record_request("/caption");

    let started = Instant::now();
    let result = state.inference_service.caption(&request.image).await;
    state
        .metrics
        .record_inference_duration(started.elapsed().as_millis() as u64, "caption");

    match result {
        Ok(caption) => Json(CaptionResponse {
            caption,
            error: None,
        })
        .into_response(),
        Err(e) => {
            state.metrics.record_inference_failure("caption", e.kind());
            let response = CaptionResponse {
                caption: CAPTION_ERROR.to_string(),
                error: Some(inference_message(&e).to_string()),
            };
            (inference_status(&e), Json(response)).into_response()
        }
    }
}
