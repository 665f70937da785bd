use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Failed to preprocess image: {0}")]
    Preprocess(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Inference task aborted: {0}")]
    Aborted(String),
}

impl From<ort::Error> for ModelError {
    fn from(err: ort::Error) -> Self {
        ModelError::Inference(err.to_string())
    }
}

/// Maps an RGB image to a natural-language description.
#[async_trait]
pub trait CaptionModel: Send + Sync + 'static {
    async fn caption(&self, image: RgbImage) -> Result<String, ModelError>;
}

/// Maps an image and a question to ranked answer candidates, best first.
///
/// An empty vector means the model produced no answer.
#[async_trait]
pub trait VqaModel: Send + Sync + 'static {
    async fn answer(&self, image: RgbImage, question: &str) -> Result<Vec<String>, ModelError>;
}
