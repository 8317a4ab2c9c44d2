use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::format::{FormatConverter, output_path, size_suffix, thumbnail_suffix};
use super::thumbnail::ThumbnailGenerator;
use crate::assets::{Asset, Fingerprint, Variant, VariantLabel};
use crate::error::ConversionError;
use crate::image_processing::{CodecRegistry, ImageSize};
use crate::log_sink::LogSink;
use crate::settings::ConversionOptions;

/// Extension appended to an output while it is being written.
pub const STAGING_EXTENSION: &str = "partial";

/// Per-asset override point consulted before anything is converted.
pub trait ConversionHook: Send + Sync {
    fn before_convert(&self, asset: &Asset, options: &ConversionOptions) -> HookDecision;
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Proceed,
    Override(ConversionOptions),
    Skip(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub status: ConversionStatus,
    /// File the variants were produced from.
    pub source: PathBuf,
    pub main_file: Option<PathBuf>,
    pub produced_files: Vec<PathBuf>,
    pub variants: Vec<Variant>,
    pub fingerprint: Option<Fingerprint>,
    /// Options the asset was actually converted under, after any hook override.
    pub options: ConversionOptions,
    pub diagnostics: Vec<String>,
}

impl ConversionOutcome {
    fn empty(status: ConversionStatus, source: PathBuf, options: ConversionOptions) -> Self {
        Self {
            status,
            source,
            main_file: None,
            produced_files: Vec::new(),
            variants: Vec::new(),
            fingerprint: None,
            options,
            diagnostics: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ConversionStatus::Success
    }
}

/// One output slot of a conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOutput {
    pub label: VariantLabel,
    /// Target extent along the resize axis; `None` for the thumbnail.
    pub dimension: Option<u32>,
    pub path: PathBuf,
}

/// Work out which files a conversion of `source` (of `size`) produces.
///
/// Secondary sizes larger than the source along the resize axis are dropped, as
/// are repeated secondary sizes. The main size is always kept. Returns the plan
/// and a note for every dropped size.
pub fn plan_outputs(
    source: &Path,
    size: ImageSize,
    options: &ConversionOptions,
) -> (Vec<PlannedOutput>, Vec<String>) {
    let extent = options.resize_mode.extent(size.width, size.height);
    let mut plan = Vec::with_capacity(options.dimensions.len() + 1);
    let mut notes = Vec::new();
    let mut seen = BTreeSet::new();

    for (index, dimension) in options.dimensions.iter().copied().enumerate() {
        if index == 0 {
            plan.push(PlannedOutput {
                label: VariantLabel::Main,
                dimension: Some(dimension),
                path: output_path(source, "", options.format),
            });
            continue;
        }
        if dimension > extent {
            notes.push(format!(
                "Skipped size {}: source is only {}px along its {}",
                dimension, extent, options.resize_mode
            ));
            continue;
        }
        if !seen.insert(dimension) {
            notes.push(format!("Skipped repeated size {}", dimension));
            continue;
        }
        plan.push(PlannedOutput {
            label: VariantLabel::Custom(index as u8),
            dimension: Some(dimension),
            path: output_path(source, &size_suffix(dimension), options.format),
        });
    }

    plan.push(PlannedOutput {
        label: VariantLabel::Thumbnail,
        dimension: None,
        path: output_path(
            source,
            &thumbnail_suffix(options.thumbnail_size.max(1)),
            options.format,
        ),
    });

    (plan, notes)
}

/// Staging path for `path`: the final name with `.partial` appended.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(STAGING_EXTENSION);
    path.with_file_name(name)
}

/// The file an asset should be (re)converted from.
pub fn select_source(asset: &Asset) -> PathBuf {
    match &asset.original_file {
        Some(original) if original.exists() => original.clone(),
        _ => asset.file.clone(),
    }
}

struct Staged {
    label: VariantLabel,
    staging: PathBuf,
    path: PathBuf,
    size: ImageSize,
}

/// Produces the complete variant set for one asset, or nothing at all.
pub struct ConversionEngine {
    registry: CodecRegistry,
    hook: Option<Arc<dyn ConversionHook>>,
    log: Arc<dyn LogSink>,
}

impl ConversionEngine {
    pub fn new(registry: CodecRegistry, log: Arc<dyn LogSink>) -> Self {
        Self {
            registry,
            hook: None,
            log,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ConversionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    /// Fail early when no backend can write the target format.
    pub fn preflight(&self, options: &ConversionOptions) -> Result<(), ConversionError> {
        self.registry.preflight(options.format).map(|_| ())
    }

    /// Convert `asset` under `options`.
    ///
    /// Only codec availability errors are returned as `Err`; every other problem
    /// yields a `Failed` outcome after the asset's staged files are removed.
    pub fn convert_asset(
        &self,
        asset: &Asset,
        options: &ConversionOptions,
    ) -> Result<ConversionOutcome, ConversionError> {
        let source = select_source(asset);

        let options = match self.hook.as_ref().map(|h| h.before_convert(asset, options)) {
            None | Some(HookDecision::Proceed) => options.clone(),
            Some(HookDecision::Override(overridden)) => overridden,
            Some(HookDecision::Skip(reason)) => {
                let mut outcome =
                    ConversionOutcome::empty(ConversionStatus::Skipped, source, options.clone());
                outcome.diagnostics.push(reason);
                return Ok(outcome);
            }
        };

        let backend = self.registry.preflight(options.format)?;
        let converter = FormatConverter::with_backend(backend.clone(), &options);
        let thumbnails = ThumbnailGenerator::new(backend, &options);

        let source_len = match std::fs::metadata(&source) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                let message = format!("Source {:?} of {} is unreadable: {}", source, asset.id, e);
                self.log.error(message.clone());
                let mut outcome = ConversionOutcome::empty(ConversionStatus::Failed, source, options);
                outcome.diagnostics.push(message);
                return Ok(outcome);
            }
        };

        if source_len < options.min_size_bytes {
            debug!(
                "Skipping {}: {} bytes is below the {} byte minimum",
                asset.id, source_len, options.min_size_bytes
            );
            let mut outcome = ConversionOutcome::empty(ConversionStatus::Skipped, source, options);
            outcome
                .diagnostics
                .push(format!("Source is smaller than {} bytes", outcome.options.min_size_bytes));
            return Ok(outcome);
        }

        let size = match converter.probe(&source) {
            Ok(size) => size,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let message = format!("Could not open {:?} for {}: {}", source, asset.id, e);
                self.log.error(message.clone());
                let mut outcome = ConversionOutcome::empty(ConversionStatus::Failed, source, options);
                outcome.diagnostics.push(message);
                return Ok(outcome);
            }
        };

        let (plan, mut diagnostics) = plan_outputs(&source, size, &options);
        let mut staged: Vec<Staged> = Vec::with_capacity(plan.len());

        for output in &plan {
            let staging = staging_path(&output.path);
            let result = match output.dimension {
                Some(dimension) => converter.convert_to(&source, dimension, &staging),
                None => thumbnails.generate_to(&source, &staging),
            };
            match result {
                Ok(file) => staged.push(Staged {
                    label: output.label,
                    staging,
                    path: output.path.clone(),
                    size: file.size,
                }),
                Err(e) => {
                    // The failed step may have left a partial file behind
                    let mut leftovers: Vec<PathBuf> =
                        staged.iter().map(|s| s.staging.clone()).collect();
                    leftovers.push(staging);
                    let removed = remove_files(&leftovers);
                    let message = format!(
                        "Rolled back {}: {} failed ({}); removed {} file(s)",
                        asset.id, output.label, e, removed
                    );
                    self.log.error(message.clone());
                    if e.is_fatal() {
                        return Err(e);
                    }
                    diagnostics.push(message);
                    let mut outcome =
                        ConversionOutcome::empty(ConversionStatus::Failed, source, options);
                    outcome.diagnostics = diagnostics;
                    return Ok(outcome);
                }
            }
        }

        if let Err(message) = self.commit_staged(asset, &staged) {
            diagnostics.push(message);
            let mut outcome = ConversionOutcome::empty(ConversionStatus::Failed, source, options);
            outcome.diagnostics = diagnostics;
            return Ok(outcome);
        }

        let mime = options.format.mime_type().to_string();
        let variants: Vec<Variant> = staged
            .iter()
            .map(|s| Variant {
                label: s.label,
                file: file_name(&s.path),
                width: s.size.width,
                height: s.size.height,
                mime: mime.clone(),
            })
            .collect();
        let produced_files: Vec<PathBuf> = staged.into_iter().map(|s| s.path).collect();

        debug!(
            "Converted {} from {:?} into {} file(s)",
            asset.id,
            source,
            produced_files.len()
        );

        Ok(ConversionOutcome {
            status: ConversionStatus::Success,
            source,
            main_file: produced_files.first().cloned(),
            produced_files,
            variants,
            fingerprint: Some(options.fingerprint()),
            options,
            diagnostics,
        })
    }

    /// Move every staged file onto its final name. On a failed rename the
    /// remaining staged files are removed, as are finals this commit created.
    fn commit_staged(&self, asset: &Asset, staged: &[Staged]) -> Result<(), String> {
        let mut created: Vec<PathBuf> = Vec::new();

        for (index, file) in staged.iter().enumerate() {
            let existed = file.path.exists();
            if let Err(e) = std::fs::rename(&file.staging, &file.path) {
                let mut leftovers: Vec<PathBuf> =
                    staged[index..].iter().map(|s| s.staging.clone()).collect();
                leftovers.append(&mut created);
                let removed = remove_files(&leftovers);
                let message = format!(
                    "Rolled back {}: could not move {:?} into place ({}); removed {} file(s)",
                    asset.id, file.path, e, removed
                );
                self.log.error(message.clone());
                return Err(message);
            }
            if !existed {
                created.push(file.path.clone());
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?} during rollback: {}", path, e),
        }
    }
    removed
}
