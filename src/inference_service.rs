use crate::{
    image_store::{ImageStore, StoreError, StoredImage},
    model_host::{ModelHost, ModelStatus},
    model_service::ModelError,
};
use image::RgbImage;
use std::{fmt, path::Path, sync::Arc};
use thiserror::Error;
use tracing::instrument;

pub const CAPTION_ERROR: &str = "Error generating caption.";
pub const ANSWER_ERROR: &str = "Error answering question.";
pub const NO_ANSWER: &str = "No answer found.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Caption,
    Vqa,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Caption => "caption",
            ModelKind::Vqa => "vqa",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),
    #[error("Image could not be read: {0}")]
    UnreadableImage(String),
    #[error("The {0} model is not available")]
    ModelUnavailable(ModelKind),
    #[error("The {0} model failed: {1}")]
    Model(ModelKind, ModelError),
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::ImageNotFound(_) => "image_not_found",
            InferenceError::UnreadableImage(_) => "unreadable_image",
            InferenceError::ModelUnavailable(_) => "model_unavailable",
            InferenceError::Model(..) => "model_failure",
        }
    }
}

impl From<StoreError> for InferenceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(reference) => InferenceError::ImageNotFound(reference),
            other => InferenceError::UnreadableImage(other.to_string()),
        }
    }
}

async fn load_rgb_image(path: &Path) -> Result<RgbImage, InferenceError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let image = image::ImageReader::open(&path)
            .map_err(|e| format!("Error opening {:?}: {}", path, e))?
            .with_guessed_format()
            .map_err(|e| format!("Error reading {:?}: {}", path, e))?
            .decode()
            .map_err(|e| format!("Error decoding {:?}: {}", path, e))?;
        Ok::<_, String>(image.to_rgb8())
    })
    .await
    .map_err(|e| InferenceError::UnreadableImage(e.to_string()))?
    .map_err(InferenceError::UnreadableImage)
}

/// Runs the captioning and question answering models against stored uploads.
#[derive(Clone)]
pub struct InferenceService {
    models: Arc<ModelHost>,
    images: Arc<ImageStore>,
}

impl InferenceService {
    pub fn new(models: Arc<ModelHost>, images: Arc<ImageStore>) -> Self {
        Self { models, images }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn model_status(&self) -> ModelStatus {
        self.models.status()
    }

    #[instrument(skip(self))]
    pub async fn caption(&self, reference: &str) -> Result<String, InferenceError> {
        let result = match self.images.resolve(reference) {
            Ok(image) => self.run_caption(&image).await,
            Err(e) => Err(e.into()),
        };
        log_failure("Error generating caption", result)
    }

    #[instrument(skip(self, image), fields(image_id = %image.id))]
    pub async fn caption_stored(&self, image: &StoredImage) -> Result<String, InferenceError> {
        log_failure("Error generating caption", self.run_caption(image).await)
    }

    #[instrument(skip(self))]
    pub async fn answer(&self, reference: &str, question: &str) -> Result<String, InferenceError> {
        let result = match self.images.resolve(reference) {
            Ok(image) => self.run_answer(&image, question).await,
            Err(e) => Err(e.into()),
        };
        log_failure("Error answering question", result)
    }

    async fn run_caption(&self, image: &StoredImage) -> Result<String, InferenceError> {
        let model = self
            .models
            .caption_model()
            .ok_or(InferenceError::ModelUnavailable(ModelKind::Caption))?;
        let rgb = load_rgb_image(&image.path).await?;

        let caption = model
            .caption(rgb)
            .await
            .map_err(|e| InferenceError::Model(ModelKind::Caption, e))?;

        tracing::debug!("Caption for {}: {:?}", image.id, caption);
        Ok(caption)
    }

    async fn run_answer(&self, image: &StoredImage, question: &str) -> Result<String, InferenceError> {
        let model = self
            .models
            .vqa_model()
            .ok_or(InferenceError::ModelUnavailable(ModelKind::Vqa))?;
        let rgb = load_rgb_image(&image.path).await?;

        let candidates = model
            .answer(rgb, question)
            .await
            .map_err(|e| InferenceError::Model(ModelKind::Vqa, e))?;

        tracing::debug!("{} answer candidates for {}", candidates.len(), image.id);
        Ok(candidates
            .into_iter()
            .next()
            .unwrap_or_else(|| NO_ANSWER.to_string()))
    }
}

fn log_failure(context: &str, result: Result<String, InferenceError>) -> Result<String, InferenceError> {
    if let Err(e) = &result {
        tracing::error!(kind = e.kind(), "{}: {}", context, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        png_bytes, temp_image_store, FailingModel, MockCaptionModel, MockVqaModel,
    };

    fn service(models: ModelHost) -> (tempfile::TempDir, InferenceService) {
        let (dir, store) = temp_image_store();
        (dir, InferenceService::new(Arc::new(models), Arc::new(store)))
    }

    fn full_host() -> ModelHost {
        ModelHost::new(
            Some(Arc::new(MockCaptionModel)),
            Some(Arc::new(MockVqaModel::answering(&["white"]))),
        )
    }

    #[tokio::test]
    async fn test_caption() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, service) = service(full_host());
        let image = service.images().store(&png_bytes(), Some("cat.png")).await?;

        let caption = service.caption(&image.public_url).await?;

        assert_eq!(caption, "a 8x6 picture");
        assert_eq!(service.caption_stored(&image).await?, caption);
        Ok(())
    }

    #[tokio::test]
    async fn test_answer_returns_top_candidate() -> Result<(), Box<dyn std::error::Error>> {
        let host = ModelHost::new(
            None,
            Some(Arc::new(MockVqaModel::answering(&["white", "grey"]))),
        );
        let (_dir, service) = service(host);
        let image = service.images().store(&png_bytes(), Some("cat.png")).await?;

        let first = service.answer(&image.public_url, "What color is the animal?").await?;
        let second = service.answer(&image.public_url, "What color is the animal?").await?;

        assert_eq!(first, "white");
        assert_eq!(second, "white");
        Ok(())
    }

    #[tokio::test]
    async fn test_answer_without_candidates() -> Result<(), Box<dyn std::error::Error>> {
        let host = ModelHost::new(None, Some(Arc::new(MockVqaModel::answering(&[]))));
        let (_dir, service) = service(host);
        let image = service.images().store(&png_bytes(), Some("cat.png")).await?;

        let answer = service.answer(&image.id.to_string(), "Is it a dog?").await?;

        assert_eq!(answer, NO_ANSWER);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_image_is_unreadable() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, service) = service(full_host());
        let image = service.images().store(b"definitely not an image", Some("cat.jpg")).await?;

        let caption = service.caption(&image.public_url).await;
        let answer = service.answer(&image.public_url, "What is it?").await;

        assert!(matches!(caption, Err(InferenceError::UnreadableImage(_))));
        assert!(matches!(answer, Err(InferenceError::UnreadableImage(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_reference() {
        let (_dir, service) = service(full_host());

        let result = service.answer("/static/uploads/cat.jpg", "What is it?").await;

        assert!(matches!(result, Err(InferenceError::ImageNotFound(_))));
    }

    #[tokio::test]
    async fn test_unloaded_models_are_unavailable() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, service) = service(ModelHost::default());
        let image = service.images().store(&png_bytes(), Some("cat.png")).await?;

        let caption = service.caption(&image.public_url).await;
        let answer = service.answer(&image.public_url, "What is it?").await;

        assert!(matches!(
            caption,
            Err(InferenceError::ModelUnavailable(ModelKind::Caption))
        ));
        assert!(matches!(
            answer,
            Err(InferenceError::ModelUnavailable(ModelKind::Vqa))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_model_failure() -> Result<(), Box<dyn std::error::Error>> {
        let host = ModelHost::new(Some(Arc::new(FailingModel)), Some(Arc::new(FailingModel)));
        let (_dir, service) = service(host);
        let image = service.images().store(&png_bytes(), Some("cat.png")).await?;

        let caption = service.caption(&image.public_url).await;
        let answer = service.answer(&image.public_url, "What is it?").await;

        let err = caption.unwrap_err();
        assert_eq!(err.kind(), "model_failure");
        assert!(matches!(answer, Err(InferenceError::Model(ModelKind::Vqa, _))));
        Ok(())
    }
}
