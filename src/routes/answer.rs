use super::{form_or_json, inference_message, inference_status, non_blank, ErrorBody};
use crate::{inference_service::ANSWER_ERROR, server::SharedState};
use axum::{
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Deserialize, Default)]
#[serde(default)]
struct AnswerFields {
    image: String,
    question: String,
}

#[derive(Debug)]
pub struct AnswerRequest {
    pub image: String,
    pub question: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AnswerResponse {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum AnswerError {
    #[error("No image or question provided")]
    MissingInput,
}

impl IntoResponse for AnswerError {
    fn into_response(self) -> Response {
        let error = match self {
            AnswerError::MissingInput => "No image or question provided",
        };
        (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response()
    }
}

impl<S> FromRequest<S> for AnswerRequest
where
    S: Send + Sync,
{
    type Rejection = AnswerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let fields: AnswerFields = form_or_json(req, state).await;

        match (non_blank(fields.image), non_blank(fields.question)) {
            (Some(image), Some(question)) => Ok(Self { image, question }),
            _ => Err(AnswerError::MissingInput),
        }
    }
}

#[instrument(skip(state))]
pub async fn answer_question(
    State(state): State<SharedState>,
    request: AnswerRequest,
) -> Response {
    state.metrics.record_request("/answer");

    let started = Instant::now();
    let result = state
        .inference_service
        .answer(&request.image, &request.question)
        .await;
    state
        .metrics
        .record_inference_duration(started.elapsed().as_millis() as u64, "vqa");

    match result {
        Ok(answer) => (StatusCode::OK, Json(AnswerResponse { answer, error: None })).into_response(),
        Err(e) => {
            state.metrics.record_inference_failure("vqa", e.kind());
            let response = AnswerResponse {
                answer: ANSWER_ERROR.to_string(),
                error: Some(inference_message(&e).to_string()),
            };
            (inference_status(&e), Json(response)).into_response()
        }
    }
}
