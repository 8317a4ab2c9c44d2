use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::assets::{AssetFormat, AssetId, AssetRepository, VariantRecord};
use crate::batch::{BatchDriver, BatchReport};
use crate::cleanup::{CleanupReconciler, CleanupReport};
use crate::commit::commit_success;
use crate::converter::{ConversionEngine, ConversionHook, ConversionStatus};
use crate::error::{DeleteError, PipelineError, RepositoryError};
use crate::fingerprint::FingerprintTracker;
use crate::fs::{ExistenceCache, RetryPolicy};
use crate::image_processing::CodecRegistry;
use crate::import::{ImportReport, import_tree};
use crate::log_sink::LogSink;
use crate::memory::{DEFAULT_THRESHOLD_FRACTION, MemoryProbe, SysinfoProbe, process_alive};
use crate::retention::{DeletionVeto, OriginalRetentionPolicy};
use crate::settings::{
    ConversionOptions, DEFAULT_THUMBNAIL_SIZE, SettingValue, Settings, SettingsStore, keys,
};

const LOCK_FILE: &str = "imgpress.lock";

/// Exclusive claim on an asset tree, held for the duration of one operation.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Claim the tree. A lock left behind by a process that is no longer
    /// running is taken over.
    pub fn acquire(state_directory: &Path) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(state_directory)?;
        let path = state_directory.join(LOCK_FILE);
        match Self::create(&path) {
            Err(PipelineError::Busy(_)) if Self::holder_is_gone(&path) => {
                warn!("Removing stale run lock {:?}", path);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Self::create(&path)
            }
            result => result,
        }
    }

    fn create(path: &Path) -> Result<Self, PipelineError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(PipelineError::Busy(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True only when the lock names a pid that is not running. An unreadable
    /// lock may still be mid-write and counts as held.
    fn holder_is_gone(path: &Path) -> bool {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok())
            .is_some_and(|pid| !process_alive(pid))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}

/// Why a single-asset conversion was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fired by the host after an upload; honours `disable-auto-convert`.
    Upload,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleResult {
    Converted,
    UpToDate,
    Excluded,
    AutoConvertDisabled,
    Skipped,
    Failed,
}

/// Host-facing entry points over one asset tree.
pub struct Pipeline {
    root: PathBuf,
    state_directory: PathBuf,
    settings: Arc<dyn SettingsStore>,
    repository: Arc<dyn AssetRepository>,
    log: Arc<dyn LogSink>,
    engine: Arc<ConversionEngine>,
    retention: Arc<OriginalRetentionPolicy>,
    thumbnail_size: u32,
    batch: Mutex<BatchDriver>,
    cleanup: Mutex<CleanupReconciler>,
    cancel: Arc<AtomicBool>,
}

pub struct PipelineBuilder {
    root: PathBuf,
    state_directory: PathBuf,
    settings: Arc<dyn SettingsStore>,
    repository: Arc<dyn AssetRepository>,
    log: Arc<dyn LogSink>,
    registry: CodecRegistry,
    hook: Option<Arc<dyn ConversionHook>>,
    veto: Option<Arc<dyn DeletionVeto>>,
    memory: Option<Arc<dyn MemoryProbe>>,
    memory_threshold: f64,
    retry: RetryPolicy,
    thumbnail_size: u32,
    cancel: Arc<AtomicBool>,
}

impl PipelineBuilder {
    pub fn registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn ConversionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn veto(mut self, veto: Arc<dyn DeletionVeto>) -> Self {
        self.veto = Some(veto);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = Some(probe);
        self
    }

    pub fn memory_threshold(mut self, fraction: f64) -> Self {
        self.memory_threshold = fraction;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn thumbnail_size(mut self, size: u32) -> Self {
        self.thumbnail_size = size.max(1);
        self
    }

    pub fn cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Pipeline {
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(SysinfoProbe::new(None)));

        let mut engine = ConversionEngine::new(self.registry, self.log.clone());
        if let Some(hook) = self.hook {
            engine = engine.with_hook(hook);
        }
        let engine = Arc::new(engine);

        let mut retention = OriginalRetentionPolicy::new(self.retry);
        if let Some(veto) = self.veto {
            retention = retention.with_veto(veto);
        }
        let retention = Arc::new(retention);

        let batch = BatchDriver::new(
            self.settings.clone(),
            self.repository.clone(),
            self.log.clone(),
            engine.clone(),
            retention.clone(),
            memory.clone(),
            self.memory_threshold,
            self.thumbnail_size,
        )
        .with_cancel_flag(self.cancel.clone());

        let cleanup = CleanupReconciler::new(
            self.root.clone(),
            self.settings.clone(),
            self.repository.clone(),
            self.log.clone(),
            memory,
            self.memory_threshold,
            self.thumbnail_size,
            self.retry,
        )
        .with_cancel_flag(self.cancel.clone());

        Pipeline {
            root: self.root,
            state_directory: self.state_directory,
            settings: self.settings,
            repository: self.repository,
            log: self.log,
            engine,
            retention,
            thumbnail_size: self.thumbnail_size,
            batch: Mutex::new(batch),
            cleanup: Mutex::new(cleanup),
            cancel: self.cancel,
        }
    }
}

impl Pipeline {
    pub fn builder(
        root: PathBuf,
        state_directory: PathBuf,
        settings: Arc<dyn SettingsStore>,
        repository: Arc<dyn AssetRepository>,
        log: Arc<dyn LogSink>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            root,
            state_directory,
            settings,
            repository,
            log,
            registry: CodecRegistry::with_defaults(6),
            hook: None,
            veto: None,
            memory: None,
            memory_threshold: DEFAULT_THRESHOLD_FRACTION,
            retry: RetryPolicy::default(),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<dyn AssetRepository> {
        &self.repository
    }

    fn lock(&self) -> Result<RunLock, PipelineError> {
        RunLock::acquire(&self.state_directory)
    }

    fn options(&self) -> Result<(Settings, ConversionOptions), PipelineError> {
        let settings = Settings::load(self.settings.as_ref())?;
        let options = ConversionOptions::from_settings(&settings, self.thumbnail_size);
        Ok((settings, options))
    }

    pub fn run_batch(&self, offset: usize, page_size: usize) -> Result<BatchReport, PipelineError> {
        let _lock = self.lock()?;
        relock(&self.batch).run_batch(offset, page_size)
    }

    pub fn resume(&self) -> Result<BatchReport, PipelineError> {
        let _lock = self.lock()?;
        relock(&self.batch).resume()
    }

    pub fn reconcile(&self, batch_limit: usize) -> Result<CleanupReport, PipelineError> {
        let _lock = self.lock()?;
        relock(&self.cleanup).reconcile(batch_limit)
    }

    /// Register legacy files under the storage root as new assets.
    pub fn import(&self) -> Result<ImportReport, PipelineError> {
        let _lock = self.lock()?;
        Ok(import_tree(&self.root, self.repository.as_ref())?)
    }

    /// Convert a single asset now, outside any batch.
    pub fn convert_one(&self, id: AssetId, trigger: Trigger) -> Result<SingleResult, PipelineError> {
        let _lock = self.lock()?;
        let (settings, options) = self.options()?;

        if trigger == Trigger::Upload && settings.disable_auto_convert {
            debug!("Auto conversion disabled, leaving {} as uploaded", id);
            return Ok(SingleResult::AutoConvertDisabled);
        }
        if options.is_excluded(id) {
            return Ok(SingleResult::Excluded);
        }

        let asset = self.repository.load(id)?;
        if FingerprintTracker::new(&options).is_up_to_date(&asset) {
            return Ok(SingleResult::UpToDate);
        }

        let outcome = self.engine.convert_asset(&asset, &options)?;
        Ok(match outcome.status {
            ConversionStatus::Success => {
                commit_success(
                    self.repository.as_ref(),
                    self.retention.as_ref(),
                    self.log.as_ref(),
                    &mut ExistenceCache::new(),
                    &asset,
                    &outcome,
                )?;
                SingleResult::Converted
            }
            ConversionStatus::Skipped => SingleResult::Skipped,
            ConversionStatus::Failed => SingleResult::Failed,
        })
    }

    /// Point the asset back at its retained original and drop its variants.
    ///
    /// The asset joins the exclusion set so the next batch does not convert it
    /// again; removing it from the set later converts it while keeping the
    /// original.
    pub fn restore_original(&self, id: AssetId) -> Result<usize, PipelineError> {
        let _lock = self.lock()?;
        let asset = self.repository.load(id)?;

        let Some(original) = asset.original_file.clone().filter(|p| p.exists()) else {
            return Err(RepositoryError::IoError(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} has no retained original", id),
            ))
            .into());
        };
        let Some(format) = AssetFormat::from_path(&original) else {
            return Err(RepositoryError::IoError(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("unrecognised original {:?}", original),
            ))
            .into());
        };

        self.repository.commit(
            id,
            &original,
            format,
            VariantRecord {
                variants: Vec::new(),
                fingerprint: None,
                original_file: None,
                restored: true,
            },
        )?;

        let mut stale: Vec<PathBuf> = asset.variant_paths().collect();
        stale.push(asset.file.clone());
        stale.sort();
        stale.dedup();
        let removed = self.remove_files(id, stale.iter().filter(|p| **p != original));

        let mut settings = Settings::load(self.settings.as_ref())?;
        if settings.excluded.insert(id) {
            self.settings.set(
                keys::EXCLUDED_ASSET_IDS,
                SettingValue::List(settings.excluded.iter().map(|id| id.0 as i64).collect()),
            )?;
        }

        info!("Restored {} to {:?}", id, original);
        self.log
            .info(format!("Restored {} to its original {:?}", id, original));
        Ok(removed)
    }

    /// Forget a deleted asset and remove every file it owned.
    pub fn on_asset_deleted(&self, id: AssetId) -> Result<usize, PipelineError> {
        let _lock = self.lock()?;
        let Some(asset) = self.repository.remove(id)? else {
            return Ok(0);
        };

        let mut files: Vec<PathBuf> = asset.variant_paths().collect();
        files.push(asset.file.clone());
        files.extend(asset.original_file.clone());
        files.sort();
        files.dedup();
        let removed = self.remove_files(id, files.iter());

        let mut settings = Settings::load(self.settings.as_ref())?;
        if settings.excluded.remove(&id) {
            self.settings.set(
                keys::EXCLUDED_ASSET_IDS,
                SettingValue::List(settings.excluded.iter().map(|id| id.0 as i64).collect()),
            )?;
        }

        debug!("Removed {} file(s) of deleted asset {}", removed, id);
        Ok(removed)
    }

    fn remove_files<'a>(&self, id: AssetId, paths: impl Iterator<Item = &'a PathBuf>) -> usize {
        let mut removed = 0;
        for path in paths {
            match self.retention.delete(path) {
                Ok(()) => removed += 1,
                Err(DeleteError::FileNotFound(_)) => {}
                Err(e) => self
                    .log
                    .warn(format!("Could not delete {:?} of {}: {}", path, id, e)),
            }
        }
        removed
    }
}

/// Lock, recovering the guard if a previous holder panicked.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
