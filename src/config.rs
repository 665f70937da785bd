use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub storage: StorageConfig,
    pub models: ModelsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub static_dir: PathBuf,
    #[serde(default = "default_uploads_subdir")]
    pub uploads_subdir: String,
    pub templates_dir: PathBuf,
}

fn default_uploads_subdir() -> String {
    "uploads".to_string()
}

impl StorageConfig {
    pub fn get_upload_dir(&self) -> PathBuf {
        self.static_dir.join(self.uploads_subdir.trim_matches('/'))
    }

    /// URL prefix under which uploaded files are served by the static route.
    pub fn get_public_prefix(&self) -> String {
        format!("/static/{}", self.uploads_subdir.trim_matches('/'))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default)]
    pub tokens: SpecialTokens,
    pub caption: CaptionModelConfig,
    pub vqa: VqaModelConfig,
}

fn default_model_instances() -> usize {
    1
}

fn default_intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_image_size() -> u32 {
    384
}

/// Token ids of the BLIP BERT vocabulary used to drive decoding.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SpecialTokens {
    pub bos_token_id: i64,
    pub sep_token_id: i64,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos_token_id: 30522,
            sep_token_id: 102,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptionModelConfig {
    pub vision_file: String,
    pub decoder_file: String,
    pub tokenizer_file: String,
    #[serde(default = "default_caption_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub prompt: Option<String>,
}

fn default_caption_max_new_tokens() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VqaMode {
    /// Question encoded against the image, answer decoded from the question embeddings.
    Encoder,
    /// Answer decoded straight from the image, conditioned on a question prompt.
    Prompted,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VqaModelConfig {
    pub vision_file: String,
    #[serde(default)]
    pub text_encoder_file: Option<String>,
    pub decoder_file: String,
    pub tokenizer_file: String,
    #[serde(default = "default_vqa_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_vqa_mode")]
    pub mode: VqaMode,
}

fn default_vqa_max_new_tokens() -> usize {
    20
}

fn default_vqa_mode() -> VqaMode {
    VqaMode::Encoder
}

pub trait Validatable {
    fn get_paths(&self, model_dir: &std::path::Path) -> Vec<PathBuf>;

    fn validate(&self, model_dir: &std::path::Path) -> Result<(), String> {
        for path in self.get_paths(model_dir) {
            if !path.exists() {
                return Err(format!("Model file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

impl Validatable for CaptionModelConfig {
    fn get_paths(&self, model_dir: &std::path::Path) -> Vec<PathBuf> {
        vec![
            model_dir.join(&self.vision_file),
            model_dir.join(&self.decoder_file),
            model_dir.join(&self.tokenizer_file),
        ]
    }
}

impl Validatable for VqaModelConfig {
    fn get_paths(&self, model_dir: &std::path::Path) -> Vec<PathBuf> {
        let mut paths = vec![
            model_dir.join(&self.vision_file),
            model_dir.join(&self.decoder_file),
            model_dir.join(&self.tokenizer_file),
        ];
        if let Some(encoder) = &self.text_encoder_file {
            paths.push(model_dir.join(encoder));
        }
        paths
    }

    fn validate(&self, model_dir: &std::path::Path) -> Result<(), String> {
        if self.mode == VqaMode::Encoder && self.text_encoder_file.is_none() {
            return Err("`text_encoder_file` is required in `encoder` mode".to_string());
        }
        for path in self.get_paths(model_dir) {
            if !path.exists() {
                return Err(format!("Model file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize::<Config>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_prefix_follows_uploads_subdir() {
        let storage = StorageConfig {
            static_dir: PathBuf::from("static"),
            uploads_subdir: "/uploads/".to_string(),
            templates_dir: PathBuf::from("templates"),
        };

        assert_eq!(storage.get_public_prefix(), "/static/uploads");
        assert_eq!(storage.get_upload_dir(), PathBuf::from("static").join("uploads"));
    }

    #[test]
    fn test_log_level_parsing() {
        let level: LogLevel = "DEBUG".to_string().try_into().unwrap();
        assert_eq!(level.as_str(), "debug");
        assert!(LogLevel::try_from("verbose".to_string()).is_err());
    }

    #[test]
    fn test_vqa_encoder_mode_requires_text_encoder() {
        let vqa = VqaModelConfig {
            vision_file: "vision.onnx".to_string(),
            text_encoder_file: None,
            decoder_file: "decoder.onnx".to_string(),
            tokenizer_file: "tokenizer.json".to_string(),
            max_new_tokens: 20,
            mode: VqaMode::Encoder,
        };

        let err = vqa.validate(std::path::Path::new(".")).unwrap_err();
        assert!(err.contains("text_encoder_file"));
    }

    #[test]
    fn test_missing_model_file_fails_validation() {
        let caption = CaptionModelConfig {
            vision_file: "does-not-exist.onnx".to_string(),
            decoder_file: "decoder.onnx".to_string(),
            tokenizer_file: "tokenizer.json".to_string(),
            max_new_tokens: 20,
            prompt: None,
        };

        let err = caption
            .validate(std::path::Path::new("/nonexistent"))
            .unwrap_err();
        assert!(err.starts_with("Model file not found"));
    }
}
