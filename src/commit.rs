use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

use crate::assets::{Asset, AssetFormat, AssetRepository, VariantRecord};
use crate::converter::ConversionOutcome;
use crate::error::{DeleteError, RepositoryError};
use crate::fs::ExistenceCache;
use crate::log_sink::LogSink;
use crate::retention::{OriginalRetentionPolicy, RetentionOutcome};

/// What a commit did besides writing the record.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// `None` when the source was not a candidate original.
    pub retention: Option<RetentionOutcome>,
    pub stale_removed: Vec<PathBuf>,
    pub stale_failed: Vec<(PathBuf, DeleteError)>,
}

/// Write a successful conversion back, then settle the files it replaced.
///
/// The record is written first so a crash afterwards leaves stale files for the
/// cleanup pass rather than a record pointing at deleted ones.
pub fn commit_success(
    repository: &dyn AssetRepository,
    retention: &OriginalRetentionPolicy,
    log: &dyn LogSink,
    cache: &mut ExistenceCache,
    asset: &Asset,
    outcome: &ConversionOutcome,
) -> Result<CommitReport, RepositoryError> {
    let Some(main_file) = outcome.main_file.as_ref() else {
        return Err(RepositoryError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("conversion of {} produced no main file", asset.id),
        )));
    };
    let fs = retention.filesystem();
    let options = &outcome.options;
    let source = &outcome.source;
    let outputs = &outcome.produced_files;

    let prior_backup_existed = asset
        .original_file
        .as_ref()
        .is_some_and(|original| cache.exists(fs, original));
    let source_is_candidate = AssetFormat::from_path(source).is_some_and(|f| f.is_legacy())
        && !outputs.contains(source);

    let mut record = VariantRecord {
        variants: outcome.variants.clone(),
        fingerprint: outcome.fingerprint.clone(),
        original_file: source_is_candidate.then(|| source.clone()),
        restored: asset.restored,
    };
    if let Err(e) = repository.commit(
        asset.id,
        main_file,
        AssetFormat::from(options.format),
        record.clone(),
    ) {
        discard_unrecorded(retention, log, cache, asset, outputs);
        return Err(e);
    }
    for output in outputs {
        cache.set(output, true);
    }

    let mut report = CommitReport::default();

    if source_is_candidate {
        let decision = retention.apply(asset, options, source, prior_backup_existed, outputs);
        match &decision {
            RetentionOutcome::Deleted(path) => {
                cache.set(path, false);
                record.original_file = None;
                if let Err(e) = repository.set_metadata(asset.id, record) {
                    log.warn(format!(
                        "Deleted original {:?} of {} but could not clear it from the record: {}",
                        path, asset.id, e
                    ));
                }
                debug!("Deleted original {:?} of {}", path, asset.id);
            }
            RetentionOutcome::Preserved(..) => {}
            RetentionOutcome::DeleteFailed(path, e) => {
                log.warn(format!(
                    "Could not delete original {:?} of {}: {}",
                    path, asset.id, e
                ));
            }
        }
        report.retention = Some(decision);
    }

    // Previous variants and a previously converted main file that the new set
    // no longer contains.
    let mut stale: BTreeSet<PathBuf> = asset.variant_paths().collect();
    if !asset.format.is_legacy() {
        stale.insert(asset.file.clone());
        if source != &asset.file && !AssetFormat::from_path(source).is_some_and(|f| f.is_legacy()) {
            stale.insert(source.clone());
        }
    }
    for output in outputs {
        stale.remove(output);
    }
    if let Some(original) = &asset.original_file {
        stale.remove(original);
    }

    for path in stale {
        if !cache.exists(fs, &path) {
            continue;
        }
        match retention.delete(&path) {
            Ok(()) | Err(DeleteError::FileNotFound(_)) => {
                cache.set(&path, false);
                report.stale_removed.push(path);
            }
            Err(e) => {
                log.warn(format!(
                    "Could not delete stale file {:?} of {}: {}",
                    path, asset.id, e
                ));
                report.stale_failed.push((path, e));
            }
        }
    }

    log.info(format!(
        "Converted {} to {} ({} file(s), {} stale removed)",
        asset.id,
        options.format,
        outputs.len(),
        report.stale_removed.len()
    ));
    Ok(report)
}

/// Remove outputs of a conversion whose record could not be written, keeping
/// every file the previous record still points at.
fn discard_unrecorded(
    retention: &OriginalRetentionPolicy,
    log: &dyn LogSink,
    cache: &mut ExistenceCache,
    asset: &Asset,
    outputs: &[PathBuf],
) {
    let referenced: BTreeSet<PathBuf> = asset
        .variant_paths()
        .chain(std::iter::once(asset.file.clone()))
        .chain(asset.original_file.clone())
        .collect();

    for output in outputs.iter().filter(|p| !referenced.contains(*p)) {
        match retention.delete(output) {
            Ok(()) | Err(DeleteError::FileNotFound(_)) => cache.set(output, false),
            Err(e) => log.warn(format!(
                "Could not remove unrecorded output {:?} of {}: {}",
                output, asset.id, e
            )),
        }
    }
}
