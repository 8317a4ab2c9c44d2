use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod assets;
pub mod batch;
pub mod cleanup;
pub mod commit;
pub mod converter;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod image_processing;
pub mod import;
pub mod log_sink;
pub mod memory;
pub mod pipeline;
pub mod retention;
pub mod settings;
pub mod startup_checks;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineBuilder, RunLock, SingleResult, Trigger};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub deletion: DeletionConfig,
    #[serde(default)]
    pub codecs: CodecConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root of the asset tree, e.g. an uploads directory.
    pub root: PathBuf,
    /// Holds settings.toml, assets.json, log.json and the run lock.
    pub state_directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("uploads"),
            state_directory: PathBuf::from(".imgpress"),
        }
    }
}

impl StorageConfig {
    pub fn settings_path(&self) -> PathBuf {
        self.state_directory.join("settings.toml")
    }

    pub fn assets_path(&self) -> PathBuf {
        self.state_directory.join("assets.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_directory.join("log.json")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Fraction of the limit above which a run starts backing off.
    pub threshold_fraction: f64,
    /// Memory limit in MiB; total system memory when unset.
    #[serde(default)]
    pub limit_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold_fraction: memory::DEFAULT_THRESHOLD_FRACTION,
            limit_mb: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeletionConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        let retry = fs::RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            backoff_ms: retry.backoff.as_millis() as u64,
        }
    }
}

impl DeletionConfig {
    pub fn retry_policy(&self) -> fs::RetryPolicy {
        fs::RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodecConfig {
    /// Editor backends in order of preference.
    pub backends: Vec<String>,
    pub thumbnail_size: u32,
    /// libavif encoder speed, 0 (slowest) to 10.
    pub avif_speed: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            backends: vec![image_processing::ImageRsBackend::NAME.to_string()],
            thumbnail_size: settings::DEFAULT_THUMBNAIL_SIZE,
            avif_speed: 6,
        }
    }
}

impl CodecConfig {
    pub fn registry(&self) -> image_processing::CodecRegistry {
        image_processing::CodecRegistry::from_names(&self.backends, self.avif_speed)
    }
}
