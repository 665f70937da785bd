use crate::config::StorageConfig;
use parking_lot::RwLock;
use std::{collections::HashMap, path::PathBuf};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

const FALLBACK_FILENAME: &str = "image";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("missing file")]
    MissingFile,
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub id: Uuid,
    pub original_filename: String,
    pub storage_name: String,
    pub path: PathBuf,
    pub public_url: String,
}

/// Keeps only `[A-Za-z0-9._-]` after NFKD decomposition, so accented letters
/// fall back to their base letter. Separators and whitespace runs become `_`.
pub fn sanitize_filename(filename: &str) -> String {
    let mut sanitized = String::with_capacity(filename.len());
    let mut pending_separator = false;

    for c in filename.nfkd() {
        if c.is_whitespace() || c == '/' || c == '\\' {
            pending_separator = !sanitized.is_empty();
        } else if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            if pending_separator {
                sanitized.push('_');
                pending_separator = false;
            }
            sanitized.push(c);
        }
    }

    let sanitized = sanitized.trim_matches(|c: char| c == '.' || c == '_');
    if sanitized.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized.to_string()
    }
}

/// Upload storage. Every upload lives in its own `<upload_dir>/<id>/` directory
/// and is looked up by id, so client-supplied text never becomes a path.
pub struct ImageStore {
    upload_dir: PathBuf,
    public_prefix: String,
    index: RwLock<HashMap<Uuid, StoredImage>>,
}

impl ImageStore {
    pub fn new(upload_dir: PathBuf, public_prefix: String) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&upload_dir)?;

        let store = Self {
            upload_dir,
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
            index: RwLock::new(HashMap::new()),
        };
        let indexed = store.index_existing()?;
        tracing::info!("Indexed {} existing uploads in {:?}", indexed, store.upload_dir);

        Ok(store)
    }

    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        Self::new(config.get_upload_dir(), config.get_public_prefix())
    }

    fn entry(&self, id: Uuid, original_filename: &str, storage_name: String) -> StoredImage {
        StoredImage {
            id,
            original_filename: original_filename.to_string(),
            path: self.upload_dir.join(id.to_string()).join(&storage_name),
            public_url: format!("{}/{}/{}", self.public_prefix, id, storage_name),
            storage_name,
        }
    }

    fn index_existing(&self) -> Result<usize, StoreError> {
        let mut index = self.index.write();

        for dir in std::fs::read_dir(&self.upload_dir)? {
            let dir = dir?;
            let Some(id) = dir.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                continue;
            };
            if !dir.file_type()?.is_dir() {
                continue;
            }

            let file = std::fs::read_dir(dir.path())?
                .filter_map(Result::ok)
                .find(|f| f.file_type().map(|t| t.is_file()).unwrap_or(false));
            if let Some(name) = file.and_then(|f| f.file_name().to_str().map(str::to_string)) {
                index.insert(id, self.entry(id, &name, name.clone()));
            }
        }

        Ok(index.len())
    }

    pub async fn store(
        &self,
        bytes: &[u8],
        original_filename: Option<&str>,
    ) -> Result<StoredImage, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::MissingFile);
        }

        let original_filename = original_filename.unwrap_or_default();
        let image = self.entry(
            Uuid::new_v4(),
            original_filename,
            sanitize_filename(original_filename),
        );

        if let Some(parent) = image.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&image.path, bytes).await?;

        tracing::info!(
            image_id = %image.id,
            size = bytes.len(),
            "Stored upload {:?} as {:?} in {:?}",
            image.original_filename,
            image.storage_name,
            image.path
        );

        self.index.write().insert(image.id, image.clone());
        Ok(image)
    }

    /// Finds a stored image from its id or any URL/path carrying the id as a segment.
    pub fn resolve(&self, reference: &str) -> Result<StoredImage, StoreError> {
        let index = self.index.read();

        reference
            .trim()
            .rsplit(|c: char| c == '/' || c == '\\')
            .filter_map(|segment| Uuid::parse_str(segment).ok())
            .find_map(|id| index.get(&id).cloned())
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    pub fn count(&self) -> usize {
        self.index.read().len()
    }
}
