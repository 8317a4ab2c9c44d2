use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::assets::{
    Asset, AssetRepository, LEGACY_EXTENSIONS, is_legacy_extension, is_recognized_extension,
    lowercase_extension, recognized_extensions,
};
use crate::converter::{STAGING_EXTENSION, output_path, size_suffix, thumbnail_suffix};
use crate::error::{DeleteError, PipelineError, RepositoryError};
use crate::fs::{FileSystem, OsFileSystem, RetryPolicy, Sleeper, ThreadSleeper, delete_with_retry};
use crate::log_sink::LogSink;
use crate::memory::{MemoryGuard, MemoryProbe, MemoryStatus};
use crate::settings::{ConversionOptions, SettingValue, Settings, SettingsStore, keys};

/// Files examined between memory checks.
pub const CLEANUP_MEMORY_CHECK_INTERVAL: usize = 100;

const ACTIVE_SET_PAGE: usize = 500;

/// Paths that must survive a cleanup pass. Rebuilt on every pass.
#[derive(Debug, Default)]
pub struct ActiveFileSet {
    paths: HashSet<PathBuf>,
}

impl ActiveFileSet {
    pub fn build(
        repository: &dyn AssetRepository,
        options: &ConversionOptions,
    ) -> Result<Self, RepositoryError> {
        let mut set = Self::default();
        let none = BTreeSet::new();
        let mut offset = 0;

        loop {
            let page = repository.list_page(offset, ACTIVE_SET_PAGE, &none)?;
            for entry in &page {
                let asset = match repository.load(entry.id) {
                    Ok(asset) => asset,
                    Err(RepositoryError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if options.is_excluded(asset.id) {
                    set.protect_everything(&asset, options);
                } else {
                    set.protect_current(&asset, options);
                }
            }
            if page.len() < ACTIVE_SET_PAGE {
                break;
            }
            offset += page.len();
        }

        debug!("Active file set holds {} path(s)", set.paths.len());
        Ok(set)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn insert(&mut self, path: PathBuf) {
        self.paths.insert(path);
    }

    /// Every plausible file of an excluded asset, in any format.
    fn protect_everything(&mut self, asset: &Asset, options: &ConversionOptions) {
        let mut bases: Vec<PathBuf> = vec![asset.file.clone()];
        bases.extend(asset.original_file.clone());
        bases.extend(asset.variant_paths());

        let mut suffixes = vec![String::new(), thumbnail_suffix(options.thumbnail_size)];
        suffixes.extend(options.dimensions.iter().map(|d| size_suffix(*d)));

        for base in &bases {
            let Some(stem) = base.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            for suffix in &suffixes {
                for ext in recognized_extensions() {
                    self.insert(base.with_file_name(format!("{}{}.{}", stem, suffix, ext)));
                }
            }
        }
        for base in bases {
            self.insert(base);
        }
    }

    /// Outputs for the current format and sizes, plus whatever the record
    /// still points at.
    fn protect_current(&mut self, asset: &Asset, options: &ConversionOptions) {
        let mut sources = vec![asset.file.clone()];
        sources.extend(asset.original_file.clone());

        for source in &sources {
            self.insert(output_path(source, "", options.format));
            for dimension in options.dimensions.iter().skip(1) {
                self.insert(output_path(source, &size_suffix(*dimension), options.format));
            }
            self.insert(output_path(
                source,
                &thumbnail_suffix(options.thumbnail_size),
                options.format,
            ));
        }

        self.insert(asset.file.clone());
        for path in asset.variant_paths() {
            self.insert(path);
        }
        if let Some(original) = &asset.original_file {
            self.insert(original.clone());
        }
        if options.preserve_originals {
            for source in &sources {
                for ext in LEGACY_EXTENSIONS {
                    self.insert(source.with_extension(ext));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub start_cursor: usize,
    pub next_cursor: usize,
    pub processed: usize,
    pub deleted: usize,
    pub failed: usize,
    pub deleted_files: Vec<PathBuf>,
    pub memory_warnings: u32,
    /// The walk reached the end of the tree.
    pub completed: bool,
    pub aborted: bool,
    pub cancelled: bool,
}

/// Removes files under the storage root that no asset needs any more.
pub struct CleanupReconciler {
    root: PathBuf,
    settings: Arc<dyn SettingsStore>,
    repository: Arc<dyn AssetRepository>,
    log: Arc<dyn LogSink>,
    guard: MemoryGuard,
    thumbnail_size: u32,
    fs: Arc<dyn FileSystem>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    cancel: Arc<AtomicBool>,
}

impl CleanupReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        settings: Arc<dyn SettingsStore>,
        repository: Arc<dyn AssetRepository>,
        log: Arc<dyn LogSink>,
        memory: Arc<dyn MemoryProbe>,
        memory_threshold: f64,
        thumbnail_size: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            root,
            settings,
            repository,
            log,
            guard: MemoryGuard::new(memory, memory_threshold),
            thumbnail_size,
            fs: Arc::new(OsFileSystem),
            sleeper: Arc::new(ThreadSleeper),
            retry,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>, sleeper: Arc<dyn Sleeper>) -> Self {
        self.fs = fs;
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Continue from the persisted cursor.
    pub fn reconcile(&mut self, batch_limit: usize) -> Result<CleanupReport, PipelineError> {
        let cursor = self
            .settings
            .get(keys::CLEANUP_OFFSET)
            .and_then(|v| v.as_int())
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        self.reconcile_from(cursor, batch_limit)
    }

    /// Examine up to `batch_limit` files, skipping the first `cursor` files of
    /// the sorted walk.
    pub fn reconcile_from(
        &mut self,
        cursor: usize,
        batch_limit: usize,
    ) -> Result<CleanupReport, PipelineError> {
        let settings = Settings::load(self.settings.as_ref())?;
        let options = ConversionOptions::from_settings(&settings, self.thumbnail_size);
        let active = ActiveFileSet::build(self.repository.as_ref(), &options)?;
        let stale_converted = options.format.other().extension();
        let batch_limit = batch_limit.max(1);

        let mut report = CleanupReport {
            start_cursor: cursor,
            next_cursor: cursor,
            ..Default::default()
        };
        let mut vanished = 0;
        let mut exhausted = true;

        let files = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry under {:?}: {}", self.root, e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .skip(cursor);

        for entry in files {
            if report.processed >= batch_limit {
                exhausted = false;
                break;
            }
            if self.cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                exhausted = false;
                break;
            }
            if report.processed > 0 && report.processed % CLEANUP_MEMORY_CHECK_INTERVAL == 0 {
                let status = self.guard.check();
                report.memory_warnings = self.guard.warnings();
                match status {
                    MemoryStatus::Ok => {}
                    MemoryStatus::Warning => {
                        warn!("Memory above threshold during cleanup");
                    }
                    MemoryStatus::Abort => {
                        report.aborted = true;
                        exhausted = false;
                        break;
                    }
                }
            }

            report.processed += 1;
            let path = entry.path();

            // Only <root>/<dir>/<file> and <root>/<dir>/<dir>/<file>
            if entry.depth() < 2 {
                continue;
            }
            let Some(ext) = lowercase_extension(path) else {
                continue;
            };
            // Staging files only outlive a conversion that crashed
            let staged = ext == STAGING_EXTENSION;
            if !staged && (!is_recognized_extension(&ext) || active.contains(path)) {
                continue;
            }
            if !staged && !is_legacy_extension(&ext) && ext != stale_converted {
                continue;
            }

            match delete_with_retry(self.fs.as_ref(), self.sleeper.as_ref(), path, self.retry) {
                Ok(()) => {
                    debug!("Removed leftover {:?}", path);
                    report.deleted += 1;
                    report.deleted_files.push(path.to_path_buf());
                }
                Err(DeleteError::FileNotFound(_)) => vanished += 1,
                Err(e) => {
                    report.failed += 1;
                    self.log.warn(format!("Could not remove leftover {:?}: {}", path, e));
                }
            }
        }

        report.completed = exhausted && !report.aborted && !report.cancelled;
        report.next_cursor = if report.completed {
            0
        } else {
            cursor + report.processed - report.deleted - vanished
        };
        if report.completed || report.aborted {
            self.guard.reset();
        }

        self.settings.set(
            keys::CLEANUP_OFFSET,
            SettingValue::Int(report.next_cursor as i64),
        )?;

        info!(
            "Cleanup from {}: {} examined, {} deleted, {} failed{}",
            cursor,
            report.processed,
            report.deleted,
            report.failed,
            if report.completed { " (complete)" } else { "" }
        );
        if report.deleted + report.failed > 0 || report.aborted {
            self.log.info(format!(
                "Cleanup removed {} leftover file(s), {} failed{}",
                report.deleted,
                report.failed,
                if report.aborted {
                    "; stopped early under memory pressure"
                } else {
                    ""
                }
            ));
        }
        Ok(report)
    }
}
