use crate::{
    config::ModelsConfig,
    model_service::{CaptionModel, VqaModel},
    ort_service::{init_runtime, OrtCaptionModel, OrtVqaModel},
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub caption_model: bool,
    pub vqa_model: bool,
}

impl ModelStatus {
    pub fn is_fully_available(&self) -> bool {
        self.caption_model && self.vqa_model
    }
}

/// Read-only handles to the models, built once at startup.
///
/// A model that failed to load stays unset and requests needing it fail
/// individually instead of the whole service refusing to start.
#[derive(Clone, Default)]
pub struct ModelHost {
    caption: Option<Arc<dyn CaptionModel>>,
    vqa: Option<Arc<dyn VqaModel>>,
}

impl ModelHost {
    pub fn new(caption: Option<Arc<dyn CaptionModel>>, vqa: Option<Arc<dyn VqaModel>>) -> Self {
        Self { caption, vqa }
    }

    pub fn initialize(config: &ModelsConfig) -> Self {
        if let Err(e) = init_runtime() {
            tracing::error!("Error loading models: {}", e);
            return Self::default();
        }

        let caption = match OrtCaptionModel::new(config) {
            Ok(model) => {
                tracing::info!("Caption model loaded");
                Some(Arc::new(model) as Arc<dyn CaptionModel>)
            }
            Err(e) => {
                tracing::error!("Error loading caption model: {}", e);
                None
            }
        };

        let vqa = match OrtVqaModel::new(config) {
            Ok(model) => {
                tracing::info!("VQA model loaded in {:?} mode", config.vqa.mode);
                Some(Arc::new(model) as Arc<dyn VqaModel>)
            }
            Err(e) => {
                tracing::error!("Error loading VQA model: {}", e);
                None
            }
        };

        let host = Self::new(caption, vqa);
        if !host.status().is_fully_available() {
            tracing::warn!("Running in degraded mode: {:?}", host.status());
        }
        host
    }

    pub fn caption_model(&self) -> Option<&Arc<dyn CaptionModel>> {
        self.caption.as_ref()
    }

    pub fn vqa_model(&self) -> Option<&Arc<dyn VqaModel>> {
        self.vqa.as_ref()
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            caption_model: self.caption.is_some(),
            vqa_model: self.vqa.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptionModelConfig, SpecialTokens, VqaMode, VqaModelConfig};
    use crate::test_utils::MockCaptionModel;
    use std::path::PathBuf;

    #[test]
    fn test_status_reports_loaded_models() {
        let host = ModelHost::new(Some(Arc::new(MockCaptionModel)), None);

        let status = host.status();

        assert!(status.caption_model);
        assert!(!status.vqa_model);
        assert!(!status.is_fully_available());
        assert!(host.caption_model().is_some());
        assert!(host.vqa_model().is_none());
    }

    #[test]
    fn test_initialize_with_missing_files_degrades() {
        let config = ModelsConfig {
            model_dir: PathBuf::from("/nonexistent/models"),
            num_instances: 1,
            intra_threads: 1,
            image_size: 384,
            tokens: SpecialTokens::default(),
            caption: CaptionModelConfig {
                vision_file: "vision.onnx".to_string(),
                decoder_file: "decoder.onnx".to_string(),
                tokenizer_file: "tokenizer.json".to_string(),
                max_new_tokens: 20,
                prompt: None,
            },
            vqa: VqaModelConfig {
                vision_file: "vision.onnx".to_string(),
                text_encoder_file: Some("text_encoder.onnx".to_string()),
                decoder_file: "decoder.onnx".to_string(),
                tokenizer_file: "tokenizer.json".to_string(),
                max_new_tokens: 20,
                mode: VqaMode::Encoder,
            },
        };

        let host = ModelHost::initialize(&config);

        assert_eq!(
            host.status(),
            ModelStatus {
                caption_model: false,
                vqa_model: false
            }
        );
    }
}
