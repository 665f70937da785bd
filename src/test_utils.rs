use crate::{
    config::{
        CaptionModelConfig, Config, LogLevel, ModelsConfig, ServerConfig, SpecialTokens,
        StorageConfig, VqaMode, VqaModelConfig,
    },
    image_store::ImageStore,
    inference_service::InferenceService,
    model_host::ModelHost,
    model_service::{CaptionModel, ModelError, VqaModel},
    server::{build_router, SharedState},
    telemetry::Metrics,
};
use async_trait::async_trait;
use axum_test::TestServer;
use image::{ImageBuffer, Rgb, RgbImage};
use std::{io::Cursor, path::Path, sync::Arc};

pub struct MockCaptionModel;

#[async_trait]
impl CaptionModel for MockCaptionModel {
    async fn caption(&self, image: RgbImage) -> Result<String, ModelError> {
        Ok(format!("a {}x{} picture", image.width(), image.height()))
    }
}

pub struct MockVqaModel {
    answers: Vec<String>,
}

impl MockVqaModel {
    pub fn answering(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[async_trait]
impl VqaModel for MockVqaModel {
    async fn answer(&self, _image: RgbImage, _question: &str) -> Result<Vec<String>, ModelError> {
        Ok(self.answers.clone())
    }
}

pub struct FailingModel;

#[async_trait]
impl CaptionModel for FailingModel {
    async fn caption(&self, _image: RgbImage) -> Result<String, ModelError> {
        Err(ModelError::Inference("session exploded".to_string()))
    }
}

#[async_trait]
impl VqaModel for FailingModel {
    async fn answer(&self, _image: RgbImage, _question: &str) -> Result<Vec<String>, ModelError> {
        Err(ModelError::Inference("session exploded".to_string()))
    }
}

/// An 8x6 orange PNG.
pub fn png_bytes() -> Vec<u8> {
    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(8, 6, Rgb([255, 128, 0]));
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
    cursor.into_inner()
}

pub fn temp_image_store() -> (tempfile::TempDir, ImageStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path().join("uploads"), "/static/uploads".to_string()).unwrap();
    (dir, store)
}

pub fn test_config(root: &Path) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_upload_bytes: 1024 * 1024,
        },
        log_level: LogLevel::Debug,
        storage: StorageConfig {
            static_dir: root.join("static"),
            uploads_subdir: "uploads".to_string(),
            templates_dir: root.join("templates"),
        },
        models: ModelsConfig {
            model_dir: root.join("models"),
            num_instances: 1,
            intra_threads: 1,
            image_size: 384,
            tokens: SpecialTokens::default(),
            caption: CaptionModelConfig {
                vision_file: "caption/vision_model.onnx".to_string(),
                decoder_file: "caption/text_decoder.onnx".to_string(),
                tokenizer_file: "caption/tokenizer.json".to_string(),
                max_new_tokens: 20,
                prompt: None,
            },
            vqa: VqaModelConfig {
                vision_file: "vqa/vision_model.onnx".to_string(),
                text_encoder_file: Some("vqa/text_encoder.onnx".to_string()),
                decoder_file: "vqa/text_decoder.onnx".to_string(),
                tokenizer_file: "vqa/tokenizer.json".to_string(),
                max_new_tokens: 20,
                mode: VqaMode::Encoder,
            },
        },
    }
}

/// Router over a temporary static/templates tree, with the given models.
pub fn test_server(models: ModelHost) -> (tempfile::TempDir, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    std::fs::create_dir_all(&config.storage.templates_dir).unwrap();
    for page in ["index", "home", "about", "contact", "service"] {
        let html = format!("<!doctype html><html><body>{}</body></html>", page);
        std::fs::write(config.storage.templates_dir.join(format!("{}.html", page)), html).unwrap();
    }

    let images = ImageStore::open(&config.storage).unwrap();
    let state = SharedState {
        inference_service: InferenceService::new(Arc::new(models), Arc::new(images)),
        metrics: Arc::new(Metrics::new().unwrap()),
    };

    let server = TestServer::new(build_router(state, &config)).unwrap();
    (dir, server)
}
