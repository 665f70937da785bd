mod answer;
mod caption;
mod health;
mod metrics;
mod pages;
mod upload;

use crate::{inference_service::InferenceError, server::SharedState};
use axum::{
    extract::{FromRequest, Multipart, Request},
    http::{header, StatusCode},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{
    de::{self, value::MapDeserializer, DeserializeOwned},
    Serialize,
};
use std::collections::HashMap;

pub use pages::page_routes;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/upload", post(upload::upload_image))
        .route("/answer", post(answer::answer_question))
        .route("/caption", post(caption::caption_image))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn inference_status(err: &InferenceError) -> StatusCode {
    match err {
        InferenceError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        InferenceError::UnreadableImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
        InferenceError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        InferenceError::Model(..) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing description of a failure. Causes stay in the logs.
fn inference_message(err: &InferenceError) -> &'static str {
    match err {
        InferenceError::ImageNotFound(_) => "Image not found",
        InferenceError::UnreadableImage(_) => "Image could not be read",
        InferenceError::ModelUnavailable(_) => "Model unavailable",
        InferenceError::Model(..) => "Model inference failed",
    }
}

fn non_blank(value: String) -> Option<String> {
    Some(value).filter(|v| !v.trim().is_empty())
}

/// Reads request fields form-encoded, multipart or as JSON. An unparsable
/// body yields the default, so callers report it as missing input.
async fn form_or_json<T, S>(req: Request, state: &S) -> T
where
    T: DeserializeOwned + Default + Send + 'static,
    S: Send + Sync,
{
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let fields = if content_type.starts_with("application/json") {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(fields)| fields)
            .ok()
    } else if content_type.starts_with("multipart/form-data") {
        multipart_fields(req, state).await
    } else {
        Form::<T>::from_request(req, state)
            .await
            .map(|Form(fields)| fields)
            .ok()
    };

    fields.unwrap_or_default()
}

/// Text parts of a multipart body. File parts are skipped and the first
/// value of a repeated name wins.
async fn multipart_fields<T, S>(req: Request, state: &S) -> Option<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    let mut multipart = Multipart::from_request(req, state).await.ok()?;

    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.ok()? {
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field.text().await.ok()?;
        fields.entry(name).or_insert(value);
    }

    T::deserialize(MapDeserializer::<_, de::value::Error>::new(fields.into_iter())).ok()
}
