use std::path::PathBuf;
use thiserror::Error;

use crate::assets::AssetId;
use crate::settings::TargetFormat;

/// Errors raised while producing a single output file.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("No image editing backend is available")]
    NoCodecAvailable,

    #[error("Target format {0} is not supported by any available backend")]
    UnsupportedTargetFormat(TargetFormat),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConversionError {
    /// Errors that make the whole run pointless, checked before any file is touched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConversionError::NoCodecAvailable | ConversionError::UnsupportedTargetFormat(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("File is not writable: {0:?}")]
    NotWritable(PathBuf),

    #[error("Failed to delete {path:?} after {attempts} attempts: {source}")]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml_edit::TomlError),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Asset not found: {0}")]
    NotFound(AssetId),

    #[error("Asset already exists: {0}")]
    Duplicate(AssetId),
}

/// Errors surfaced by the host-facing operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Another run holds the lock at {0:?}")]
    Busy(PathBuf),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
