use crate::Config;
use crate::settings::TargetFormat;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupCheckError {
    #[error("Failed to create state directory: {0}")]
    StateDirectoryCreationFailed(#[from] std::io::Error),

    #[error("Storage root does not exist: {0:?}")]
    StorageRootMissing(PathBuf),

    #[error("Storage root is not readable: {0:?}")]
    StorageRootUnreadable(PathBuf),

    #[error("No codec backend is available")]
    NoCodecBackend,

    #[error("No codec backend can write {0}")]
    FormatUnavailable(TargetFormat),
}

impl StartupCheckError {
    /// Whether a run cannot go ahead at all.
    pub fn is_critical(&self) -> bool {
        !matches!(self, StartupCheckError::FormatUnavailable(_))
    }
}

pub async fn perform_startup_checks(config: &Config) -> Result<(), Vec<StartupCheckError>> {
    let mut errors = Vec::new();

    info!("Performing startup checks...");

    let state_dir = &config.storage.state_directory;
    if !state_dir.exists() {
        info!("State directory does not exist, creating: {:?}", state_dir);
        if let Err(e) = tokio::fs::create_dir_all(state_dir).await {
            error!("Failed to create state directory: {}", e);
            errors.push(StartupCheckError::StateDirectoryCreationFailed(e));
        }
    } else {
        info!("State directory exists: {:?}", state_dir);
    }

    let root = &config.storage.root;
    if !root.exists() {
        error!("Storage root does not exist: {:?}", root);
        errors.push(StartupCheckError::StorageRootMissing(root.clone()));
    } else {
        match tokio::fs::read_dir(root).await {
            Ok(_) => info!("Storage root is accessible: {:?}", root),
            Err(e) => {
                error!("Storage root is not accessible: {}", e);
                errors.push(StartupCheckError::StorageRootUnreadable(root.clone()));
            }
        }
    }

    let registry = config.codecs.registry();
    if registry.is_empty() {
        error!("None of the configured codec backends is available");
        errors.push(StartupCheckError::NoCodecBackend);
    } else {
        info!("Codec backends: {}", registry.names().join(", "));
        for format in TargetFormat::ALL {
            if registry.preflight(format).is_err() {
                warn!("No backend can write {}", format);
                errors.push(StartupCheckError::FormatUnavailable(format));
            }
        }
    }

    if errors.is_empty() {
        info!("All startup checks passed");
        Ok(())
    } else {
        error!("Startup checks failed with {} errors", errors.len());
        Err(errors)
    }
}
