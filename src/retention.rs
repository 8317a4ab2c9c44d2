use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::assets::{Asset, AssetFormat};
use crate::error::DeleteError;
use crate::fs::{FileSystem, OsFileSystem, RetryPolicy, Sleeper, ThreadSleeper, delete_with_retry};
use crate::settings::ConversionOptions;

/// External veto over deleting an asset's original.
pub trait DeletionVeto: Send + Sync {
    fn allow_delete(&self, asset: &Asset, original: &Path) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreserveReason {
    PreserveOriginalsEnabled,
    Excluded,
    PreviouslyRestored,
    BackupAlreadyExisted,
    NotLegacyRaster,
    SharedWithOutput,
    Vetoed,
}

impl std::fmt::Display for PreserveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            PreserveReason::PreserveOriginalsEnabled => "preserve-originals is enabled",
            PreserveReason::Excluded => "asset is excluded",
            PreserveReason::PreviouslyRestored => "asset was restored before",
            PreserveReason::BackupAlreadyExisted => "a backup existed before this conversion",
            PreserveReason::NotLegacyRaster => "source is not a legacy raster",
            PreserveReason::SharedWithOutput => "source path is also an output",
            PreserveReason::Vetoed => "deletion vetoed",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionDecision {
    Delete,
    Preserve(PreserveReason),
}

/// What happened to the original after a successful conversion.
#[derive(Debug)]
pub enum RetentionOutcome {
    Deleted(PathBuf),
    Preserved(PathBuf, PreserveReason),
    DeleteFailed(PathBuf, DeleteError),
}

/// Decides whether the pre-conversion source of a converted asset may go.
pub struct OriginalRetentionPolicy {
    veto: Option<Arc<dyn DeletionVeto>>,
    fs: Arc<dyn FileSystem>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
}

impl Default for OriginalRetentionPolicy {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl OriginalRetentionPolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            veto: None,
            fs: Arc::new(OsFileSystem),
            sleeper: Arc::new(ThreadSleeper),
            retry,
        }
    }

    pub fn with_veto(mut self, veto: Arc<dyn DeletionVeto>) -> Self {
        self.veto = Some(veto);
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>, sleeper: Arc<dyn Sleeper>) -> Self {
        self.fs = fs;
        self.sleeper = sleeper;
        self
    }

    pub fn filesystem(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    /// Delete `path` with the same retry routine used for originals.
    pub fn delete(&self, path: &Path) -> Result<(), DeleteError> {
        delete_with_retry(self.fs.as_ref(), self.sleeper.as_ref(), path, self.retry)
    }

    /// Pure decision for `source`, the file the asset was just converted from.
    pub fn should_delete_original(
        &self,
        asset: &Asset,
        options: &ConversionOptions,
        source: &Path,
        prior_backup_existed: bool,
        outputs: &[PathBuf],
    ) -> RetentionDecision {
        let preserve = if options.preserve_originals {
            Some(PreserveReason::PreserveOriginalsEnabled)
        } else if options.is_excluded(asset.id) {
            Some(PreserveReason::Excluded)
        } else if asset.restored {
            Some(PreserveReason::PreviouslyRestored)
        } else if prior_backup_existed {
            Some(PreserveReason::BackupAlreadyExisted)
        } else if !AssetFormat::from_path(source).is_some_and(|f| f.is_legacy()) {
            Some(PreserveReason::NotLegacyRaster)
        } else if outputs.iter().any(|o| o == source) {
            Some(PreserveReason::SharedWithOutput)
        } else if let Some(veto) = &self.veto
            && !veto.allow_delete(asset, source)
        {
            Some(PreserveReason::Vetoed)
        } else {
            None
        };

        match preserve {
            Some(reason) => RetentionDecision::Preserve(reason),
            None => RetentionDecision::Delete,
        }
    }

    /// Decide, then delete when allowed.
    pub fn apply(
        &self,
        asset: &Asset,
        options: &ConversionOptions,
        source: &Path,
        prior_backup_existed: bool,
        outputs: &[PathBuf],
    ) -> RetentionOutcome {
        match self.should_delete_original(asset, options, source, prior_backup_existed, outputs) {
            RetentionDecision::Preserve(reason) => {
                debug!("Keeping original {:?} of {}: {}", source, asset.id, reason);
                RetentionOutcome::Preserved(source.to_path_buf(), reason)
            }
            RetentionDecision::Delete => match self.delete(source) {
                Ok(()) => RetentionOutcome::Deleted(source.to_path_buf()),
                Err(e) => RetentionOutcome::DeleteFailed(source.to_path_buf(), e),
            },
        }
    }
}
