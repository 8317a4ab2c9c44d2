// Converter module - per-asset variant production
mod engine;
mod format;
mod thumbnail;

pub use engine::{
    ConversionEngine, ConversionHook, ConversionOutcome, ConversionStatus, HookDecision,
    PlannedOutput, STAGING_EXTENSION, plan_outputs, select_source, staging_path,
};
pub use format::{
    ConvertedFile, FormatConverter, fit_to_dimension, output_path, size_suffix, thumbnail_suffix,
};
pub use thumbnail::ThumbnailGenerator;
