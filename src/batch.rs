use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::assets::AssetRepository;
use crate::commit::commit_success;
use crate::converter::{ConversionEngine, ConversionStatus};
use crate::error::{PipelineError, RepositoryError};
use crate::fingerprint::FingerprintTracker;
use crate::fs::ExistenceCache;
use crate::log_sink::LogSink;
use crate::memory::{MemoryGuard, MemoryProbe, MemoryStatus};
use crate::retention::OriginalRetentionPolicy;
use crate::settings::{ConversionOptions, SettingValue, Settings, SettingsStore, keys};

/// Assets processed between memory checks.
pub const MEMORY_CHECK_INTERVAL: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub fetched: usize,
    pub converted: usize,
    pub up_to_date: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub start_offset: usize,
    pub next_offset: usize,
    /// The whole collection has been walked.
    pub done: bool,
    pub stats: BatchStats,
    /// Page size to request next; shrinks under memory pressure.
    pub next_page_size: usize,
    pub memory_warnings: u32,
    /// Stopped because memory stayed over the threshold.
    pub aborted: bool,
    pub cancelled: bool,
}

/// Walks the asset collection one page per call.
pub struct BatchDriver {
    settings: Arc<dyn SettingsStore>,
    repository: Arc<dyn AssetRepository>,
    log: Arc<dyn LogSink>,
    engine: Arc<ConversionEngine>,
    retention: Arc<OriginalRetentionPolicy>,
    guard: MemoryGuard,
    thumbnail_size: u32,
    cancel: Arc<AtomicBool>,
    cache: ExistenceCache,
}

impl BatchDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        repository: Arc<dyn AssetRepository>,
        log: Arc<dyn LogSink>,
        engine: Arc<ConversionEngine>,
        retention: Arc<OriginalRetentionPolicy>,
        memory: Arc<dyn MemoryProbe>,
        memory_threshold: f64,
        thumbnail_size: u32,
    ) -> Self {
        Self {
            settings,
            repository,
            log,
            engine,
            retention,
            guard: MemoryGuard::new(memory, memory_threshold),
            thumbnail_size,
            cancel: Arc::new(AtomicBool::new(false)),
            cache: ExistenceCache::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Continue from the persisted offset and page size.
    pub fn resume(&mut self) -> Result<BatchReport, PipelineError> {
        let settings = Settings::load(self.settings.as_ref())?;
        let offset = stored_count(self.settings.as_ref(), keys::BATCH_OFFSET).unwrap_or(0);
        let page_size =
            stored_count(self.settings.as_ref(), keys::BATCH_PAGE_SIZE).unwrap_or(settings.batch_size);
        self.run_batch(offset, page_size)
    }

    /// Process up to `page_size` eligible assets starting at `start_offset`.
    pub fn run_batch(
        &mut self,
        start_offset: usize,
        page_size: usize,
    ) -> Result<BatchReport, PipelineError> {
        self.cache.clear();
        let settings = Settings::load(self.settings.as_ref())?;
        let options = ConversionOptions::from_settings(&settings, self.thumbnail_size);
        self.engine.preflight(&options)?;

        let mut report = BatchReport {
            start_offset,
            next_offset: start_offset,
            done: false,
            stats: BatchStats::default(),
            next_page_size: page_size.max(1),
            memory_warnings: self.guard.warnings(),
            aborted: false,
            cancelled: false,
        };

        if self.check_memory(&mut report) {
            return self.finish(report, &settings);
        }

        let requested = report.next_page_size;
        let page = self
            .repository
            .list_page(start_offset, requested, &options.excluded)?;
        report.stats.fetched = page.len();
        debug!(
            "Batch at offset {}: {} of {} requested asset(s)",
            start_offset,
            page.len(),
            requested
        );

        let tracker = FingerprintTracker::new(&options);
        let mut processed = 0;

        for (index, entry) in page.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            if index > 0 && index % MEMORY_CHECK_INTERVAL == 0 && self.check_memory(&mut report) {
                break;
            }

            let asset = match self.repository.load(entry.id) {
                Ok(asset) => asset,
                Err(RepositoryError::NotFound(id)) => {
                    self.log.warn(format!("Asset {} disappeared during the batch", id));
                    report.stats.failed += 1;
                    processed += 1;
                    continue;
                }
                Err(e) => {
                    self.log
                        .error(format!("Could not load asset {}: {}", entry.id, e));
                    report.stats.failed += 1;
                    processed += 1;
                    continue;
                }
            };

            if options.is_excluded(asset.id) {
                report.stats.skipped += 1;
            } else if tracker.is_up_to_date(&asset) {
                report.stats.up_to_date += 1;
            } else {
                let outcome = self.engine.convert_asset(&asset, &options)?;
                match outcome.status {
                    ConversionStatus::Success => match commit_success(
                        self.repository.as_ref(),
                        self.retention.as_ref(),
                        self.log.as_ref(),
                        &mut self.cache,
                        &asset,
                        &outcome,
                    ) {
                        Ok(_) => report.stats.converted += 1,
                        Err(e) => {
                            self.log.error(format!(
                                "Could not record the conversion of {}: {}",
                                asset.id, e
                            ));
                            report.stats.failed += 1;
                        }
                    },
                    ConversionStatus::Skipped => report.stats.skipped += 1,
                    ConversionStatus::Failed => report.stats.failed += 1,
                }
            }
            processed += 1;
        }

        report.next_offset = start_offset + processed;
        report.done = !report.cancelled
            && !report.aborted
            && processed == page.len()
            && page.len() < requested;

        self.finish(report, &settings)
    }

    /// Returns true when the run must stop.
    fn check_memory(&mut self, report: &mut BatchReport) -> bool {
        let status = self.guard.check();
        report.memory_warnings = self.guard.warnings();
        match status {
            MemoryStatus::Ok => false,
            MemoryStatus::Warning => {
                self.cache.clear();
                report.next_page_size = (report.next_page_size / 2).max(1);
                warn!(
                    "Memory above threshold, page size reduced to {}",
                    report.next_page_size
                );
                false
            }
            MemoryStatus::Abort => {
                report.aborted = true;
                self.log.warn(format!(
                    "Stopped batch from offset {}: memory stayed above the threshold after {} warnings",
                    report.start_offset, report.memory_warnings
                ));
                true
            }
        }
    }

    fn finish(&mut self, report: BatchReport, settings: &Settings) -> Result<BatchReport, PipelineError> {
        if report.done || report.aborted {
            self.guard.reset();
        }

        let (offset, page_size) = if report.done {
            (0, settings.batch_size)
        } else {
            (report.next_offset, report.next_page_size)
        };
        self.settings
            .set(keys::BATCH_OFFSET, SettingValue::Int(offset as i64))?;
        self.settings
            .set(keys::BATCH_PAGE_SIZE, SettingValue::Int(page_size as i64))?;

        let stats = &report.stats;
        info!(
            "Batch {}..{}: {} converted, {} up to date, {} skipped, {} failed{}",
            report.start_offset,
            report.next_offset,
            stats.converted,
            stats.up_to_date,
            stats.skipped,
            stats.failed,
            if report.done { " (done)" } else { "" }
        );
        if stats.converted + stats.failed > 0 || report.done {
            self.log.info(format!(
                "Batch from offset {}: {} converted, {} failed, {} skipped{}",
                report.start_offset,
                stats.converted,
                stats.failed,
                stats.skipped + stats.up_to_date,
                if report.done { ", all assets processed" } else { "" }
            ));
        }
        Ok(report)
    }
}

impl BatchStats {
    pub fn processed(&self) -> usize {
        self.converted + self.up_to_date + self.skipped + self.failed
    }
}

fn stored_count(store: &dyn SettingsStore, key: &str) -> Option<usize> {
    store
        .get(key)
        .and_then(|value| value.as_int())
        .and_then(|n| usize::try_from(n).ok())
}
