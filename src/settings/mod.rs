// Settings module - typed view over the key/value store
mod store;
mod types;

pub use store::{MemorySettingsStore, SettingValue, SettingsStore, TomlSettingsStore, keys};
pub use types::{ResizeMode, TargetFormat};

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::assets::{AssetId, Fingerprint};
use crate::error::SettingsError;

pub const MAX_DIMENSIONS: usize = 4;
pub const MAX_DIMENSION_VALUE: u32 = 9999;
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 150;

/// Validated conversion settings, read once per pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub target_format: TargetFormat,
    pub quality: u8,
    pub resize_mode: ResizeMode,
    pub dimensions: Vec<u32>,
    pub min_size_kb: u64,
    pub preserve_originals: bool,
    pub disable_auto_convert: bool,
    pub batch_size: usize,
    pub excluded: BTreeSet<AssetId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_format: TargetFormat::WebP,
            quality: 80,
            resize_mode: ResizeMode::Width,
            dimensions: vec![1920, 1200, 600, 300],
            min_size_kb: 0,
            preserve_originals: false,
            disable_auto_convert: false,
            batch_size: 25,
            excluded: BTreeSet::new(),
        }
    }
}

impl Settings {
    /// Read and validate every recognised key, falling back to defaults for
    /// missing ones.
    pub fn load(store: &dyn SettingsStore) -> Result<Self, SettingsError> {
        let defaults = Settings::default();

        let target_format = match store.get(keys::TARGET_FORMAT_IS_ADVANCED) {
            Some(value) => TargetFormat::from_advanced_flag(
                value
                    .as_bool()
                    .ok_or_else(|| invalid(keys::TARGET_FORMAT_IS_ADVANCED, "expected a boolean"))?,
            ),
            None => defaults.target_format,
        };

        let quality = match store.get(keys::QUALITY) {
            Some(value) => {
                let quality = value
                    .as_int()
                    .ok_or_else(|| invalid(keys::QUALITY, "expected an integer"))?;
                if !(1..=100).contains(&quality) {
                    return Err(invalid(keys::QUALITY, "must be between 1 and 100"));
                }
                quality as u8
            }
            None => defaults.quality,
        };

        let resize_mode = match store.get(keys::RESIZE_MODE) {
            Some(value) => value
                .as_text()
                .ok_or_else(|| invalid(keys::RESIZE_MODE, "expected 'width' or 'height'"))?
                .parse::<ResizeMode>()
                .map_err(|reason| invalid(keys::RESIZE_MODE, &reason))?,
            None => defaults.resize_mode,
        };

        let dimensions = match store.get(keys::DIMENSIONS) {
            Some(value) => {
                let raw = value
                    .as_list()
                    .ok_or_else(|| invalid(keys::DIMENSIONS, "expected a list of integers"))?;
                validate_dimensions(&raw)?
            }
            None => defaults.dimensions,
        };

        let min_size_kb = match store.get(keys::MIN_SIZE_KB) {
            Some(value) => {
                let kb = value
                    .as_int()
                    .ok_or_else(|| invalid(keys::MIN_SIZE_KB, "expected an integer"))?;
                u64::try_from(kb).map_err(|_| invalid(keys::MIN_SIZE_KB, "must not be negative"))?
            }
            None => defaults.min_size_kb,
        };

        let batch_size = match store.get(keys::BATCH_SIZE) {
            Some(value) => {
                let size = value
                    .as_int()
                    .ok_or_else(|| invalid(keys::BATCH_SIZE, "expected an integer"))?;
                if size < 1 {
                    return Err(invalid(keys::BATCH_SIZE, "must be at least 1"));
                }
                size as usize
            }
            None => defaults.batch_size,
        };

        let excluded = match store.get(keys::EXCLUDED_ASSET_IDS) {
            Some(value) => value
                .as_list()
                .ok_or_else(|| invalid(keys::EXCLUDED_ASSET_IDS, "expected a list of ids"))?
                .into_iter()
                .map(|id| {
                    u64::try_from(id)
                        .map(AssetId)
                        .map_err(|_| invalid(keys::EXCLUDED_ASSET_IDS, "ids must not be negative"))
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
            None => defaults.excluded,
        };

        let flag = |key: &str, default: bool| -> Result<bool, SettingsError> {
            match store.get(key) {
                Some(value) => value
                    .as_bool()
                    .ok_or_else(|| invalid(key, "expected a boolean")),
                None => Ok(default),
            }
        };

        Ok(Self {
            target_format,
            quality,
            resize_mode,
            dimensions,
            min_size_kb,
            preserve_originals: flag(keys::PRESERVE_ORIGINALS, defaults.preserve_originals)?,
            disable_auto_convert: flag(keys::DISABLE_AUTO_CONVERT, defaults.disable_auto_convert)?,
            batch_size,
            excluded,
        })
    }

    /// Write every field back to the store.
    pub fn save(&self, store: &dyn SettingsStore) -> Result<(), SettingsError> {
        store.set(
            keys::TARGET_FORMAT_IS_ADVANCED,
            SettingValue::Bool(self.target_format == TargetFormat::Avif),
        )?;
        store.set(keys::QUALITY, SettingValue::Int(self.quality as i64))?;
        store.set(
            keys::RESIZE_MODE,
            SettingValue::Text(self.resize_mode.as_str().to_string()),
        )?;
        store.set(
            keys::DIMENSIONS,
            SettingValue::List(self.dimensions.iter().map(|d| *d as i64).collect()),
        )?;
        store.set(keys::MIN_SIZE_KB, SettingValue::Int(self.min_size_kb as i64))?;
        store.set(
            keys::PRESERVE_ORIGINALS,
            SettingValue::Bool(self.preserve_originals),
        )?;
        store.set(
            keys::DISABLE_AUTO_CONVERT,
            SettingValue::Bool(self.disable_auto_convert),
        )?;
        store.set(keys::BATCH_SIZE, SettingValue::Int(self.batch_size as i64))?;
        store.set(
            keys::EXCLUDED_ASSET_IDS,
            SettingValue::List(self.excluded.iter().map(|id| id.0 as i64).collect()),
        )?;
        Ok(())
    }

    pub fn is_excluded(&self, id: AssetId) -> bool {
        self.excluded.contains(&id)
    }
}

fn validate_dimensions(raw: &[i64]) -> Result<Vec<u32>, SettingsError> {
    if raw.is_empty() || raw.len() > MAX_DIMENSIONS {
        return Err(invalid(
            keys::DIMENSIONS,
            &format!("expected between 1 and {} sizes", MAX_DIMENSIONS),
        ));
    }
    raw.iter()
        .map(|d| {
            if *d < 1 || *d > MAX_DIMENSION_VALUE as i64 {
                Err(invalid(
                    keys::DIMENSIONS,
                    &format!("size {} outside 1..={}", d, MAX_DIMENSION_VALUE),
                ))
            } else {
                Ok(*d as u32)
            }
        })
        .collect()
}

fn invalid(key: &str, reason: &str) -> SettingsError {
    SettingsError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Immutable options threaded through one run. Built once from [`Settings`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOptions {
    pub format: TargetFormat,
    pub quality: u8,
    pub resize_mode: ResizeMode,
    pub dimensions: Vec<u32>,
    pub thumbnail_size: u32,
    pub min_size_bytes: u64,
    pub preserve_originals: bool,
    pub excluded: Arc<BTreeSet<AssetId>>,
}

impl ConversionOptions {
    pub fn from_settings(settings: &Settings, thumbnail_size: u32) -> Self {
        Self {
            format: settings.target_format,
            quality: settings.quality,
            resize_mode: settings.resize_mode,
            dimensions: settings.dimensions.clone(),
            thumbnail_size,
            min_size_bytes: settings.min_size_kb.saturating_mul(1024),
            preserve_originals: settings.preserve_originals,
            excluded: Arc::new(settings.excluded.clone()),
        }
    }

    /// Fingerprint an asset converted under these options carries.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            format: self.format,
            quality: self.quality,
            resize_mode: self.resize_mode,
            dimensions: self.dimensions.clone(),
        }
    }

    pub fn is_excluded(&self, id: AssetId) -> bool {
        self.excluded.contains(&id)
    }
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), DEFAULT_THUMBNAIL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_store_is_empty() {
        let store = MemorySettingsStore::new();
        let settings = Settings::load(&store).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_reads_every_key() {
        let store = MemorySettingsStore::new();
        store
            .set(keys::TARGET_FORMAT_IS_ADVANCED, SettingValue::Bool(true))
            .unwrap();
        store.set(keys::QUALITY, SettingValue::Int(65)).unwrap();
        store
            .set(keys::RESIZE_MODE, SettingValue::Text("height".into()))
            .unwrap();
        store
            .set(keys::DIMENSIONS, SettingValue::List(vec![1024, 512]))
            .unwrap();
        store.set(keys::MIN_SIZE_KB, SettingValue::Int(40)).unwrap();
        store
            .set(keys::EXCLUDED_ASSET_IDS, SettingValue::List(vec![7, 9]))
            .unwrap();

        let settings = Settings::load(&store).unwrap();
        assert_eq!(settings.target_format, TargetFormat::Avif);
        assert_eq!(settings.quality, 65);
        assert_eq!(settings.resize_mode, ResizeMode::Height);
        assert_eq!(settings.dimensions, vec![1024, 512]);
        assert_eq!(settings.min_size_kb, 40);
        assert!(settings.is_excluded(AssetId(7)));
        assert!(!settings.is_excluded(AssetId(8)));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let store = MemorySettingsStore::new();
        store.set(keys::QUALITY, SettingValue::Int(0)).unwrap();
        assert!(Settings::load(&store).is_err());

        let store = MemorySettingsStore::new();
        store
            .set(keys::DIMENSIONS, SettingValue::List(vec![1, 2, 3, 4, 5]))
            .unwrap();
        assert!(Settings::load(&store).is_err());

        let store = MemorySettingsStore::new();
        store
            .set(keys::DIMENSIONS, SettingValue::List(vec![10000]))
            .unwrap();
        assert!(Settings::load(&store).is_err());

        let store = MemorySettingsStore::new();
        store.set(keys::DIMENSIONS, SettingValue::List(vec![])).unwrap();
        assert!(Settings::load(&store).is_err());
    }

    #[test]
    fn test_save_then_load_is_stable() {
        let store = MemorySettingsStore::new();
        let mut settings = Settings::default();
        settings.dimensions = vec![800, 400];
        settings.excluded.insert(AssetId(3));
        settings.save(&store).unwrap();

        assert_eq!(Settings::load(&store).unwrap(), settings);
    }

    #[test]
    fn test_options_fingerprint_matches_settings() {
        let settings = Settings::default();
        let options = ConversionOptions::from_settings(&settings, 150);
        let fingerprint = options.fingerprint();
        assert_eq!(fingerprint.format, settings.target_format);
        assert_eq!(fingerprint.dimensions, settings.dimensions);
        assert_eq!(options.dimensions[0], 1920);
    }

    #[test]
    fn test_huge_minimum_size_saturates() {
        let store = MemorySettingsStore::new();
        store
            .set(keys::MIN_SIZE_KB, SettingValue::Int(i64::MAX))
            .unwrap();

        let settings = Settings::load(&store).unwrap();
        let options = ConversionOptions::from_settings(&settings, 150);
        assert_eq!(options.min_size_bytes, u64::MAX);
    }
}
