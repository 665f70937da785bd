use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    caption_model: bool,
    vqa_model: bool,
    uploads: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let models = state.inference_service.model_status();
    let status = if models.is_fully_available() {
        "Available"
    } else {
        "Degraded"
    };

    Json(Status {
        status: status.into(),
        caption_model: models.caption_model,
        vqa_model: models.vqa_model,
        uploads: state.inference_service.images().count(),
    })
}
