use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::settings::{ResizeMode, TargetFormat};

/// Extensions of the legacy raster formats sources arrive in.
pub const LEGACY_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub u64);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
}

impl AssetFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let mime = mime_guess::from_path(path).first()?;
        match mime.essence_str() {
            "image/jpeg" => Some(AssetFormat::Jpeg),
            "image/png" => Some(AssetFormat::Png),
            "image/webp" => Some(AssetFormat::WebP),
            "image/avif" => Some(AssetFormat::Avif),
            _ => match lowercase_extension(path).as_deref() {
                // Older mime tables do not know AVIF
                Some("avif") => Some(AssetFormat::Avif),
                _ => None,
            },
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, AssetFormat::Jpeg | AssetFormat::Png)
    }

    pub fn target(&self) -> Option<TargetFormat> {
        match self {
            AssetFormat::WebP => Some(TargetFormat::WebP),
            AssetFormat::Avif => Some(TargetFormat::Avif),
            _ => None,
        }
    }
}

impl From<TargetFormat> for AssetFormat {
    fn from(format: TargetFormat) -> Self {
        match format {
            TargetFormat::WebP => AssetFormat::WebP,
            TargetFormat::Avif => AssetFormat::Avif,
        }
    }
}

/// Lowercased extension of `path`, if any.
pub fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Every extension the pipeline reads or writes.
pub fn recognized_extensions() -> impl Iterator<Item = &'static str> {
    LEGACY_EXTENSIONS
        .into_iter()
        .chain(TargetFormat::ALL.into_iter().map(|f| f.extension()))
}

pub fn is_recognized_extension(ext: &str) -> bool {
    recognized_extensions().any(|known| known == ext)
}

pub fn is_legacy_extension(ext: &str) -> bool {
    LEGACY_EXTENSIONS.contains(&ext)
}

/// Which size slot a variant fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VariantLabel {
    Main,
    /// Secondary size, numbered by its position in the dimension list (1..=3).
    Custom(u8),
    Thumbnail,
}

impl fmt::Display for VariantLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantLabel::Main => f.write_str("main"),
            VariantLabel::Custom(n) => write!(f, "custom-{}", n),
            VariantLabel::Thumbnail => f.write_str("thumbnail"),
        }
    }
}

impl From<VariantLabel> for String {
    fn from(label: VariantLabel) -> Self {
        label.to_string()
    }
}

impl TryFrom<String> for VariantLabel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "main" => Ok(VariantLabel::Main),
            "thumbnail" => Ok(VariantLabel::Thumbnail),
            other => other
                .strip_prefix("custom-")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=3).contains(n))
                .map(VariantLabel::Custom)
                .ok_or_else(|| format!("unknown variant label '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub label: VariantLabel,
    /// File name, relative to the asset's directory.
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub mime: String,
}

/// Settings a variant set was produced under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub format: TargetFormat,
    pub quality: u8,
    pub resize_mode: ResizeMode,
    pub dimensions: Vec<u32>,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dimensions.iter().map(|d| d.to_string()).collect();
        write!(
            f,
            "{}/q{}/{}/[{}]",
            self.format,
            self.quality,
            self.resize_mode,
            dims.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub file: PathBuf,
    pub format: AssetFormat,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    /// Pre-conversion source kept on disk after conversion.
    #[serde(default)]
    pub original_file: Option<PathBuf>,
    /// Set once the asset was restored to its original format.
    #[serde(default)]
    pub restored: bool,
}

impl Asset {
    /// A freshly uploaded asset with no conversion history.
    pub fn new(id: AssetId, file: PathBuf) -> Option<Self> {
        let format = AssetFormat::from_path(&file)?;
        Some(Self {
            id,
            file,
            format,
            variants: Vec::new(),
            fingerprint: None,
            original_file: None,
            restored: false,
        })
    }

    pub fn directory(&self) -> &Path {
        self.file.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn variant_path(&self, variant: &Variant) -> PathBuf {
        self.directory().join(&variant.file)
    }

    pub fn variant_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.variants.iter().map(|v| self.variant_path(v))
    }

    pub fn record(&self) -> VariantRecord {
        VariantRecord {
            variants: self.variants.clone(),
            fingerprint: self.fingerprint.clone(),
            original_file: self.original_file.clone(),
            restored: self.restored,
        }
    }

    pub fn apply_record(&mut self, record: VariantRecord) {
        self.variants = record.variants;
        self.fingerprint = record.fingerprint;
        self.original_file = record.original_file;
        self.restored = record.restored;
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub id: AssetId,
    pub file: PathBuf,
    pub format: AssetFormat,
}

/// Mutable per-asset record written back after a conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub variants: Vec<Variant>,
    pub fingerprint: Option<Fingerprint>,
    pub original_file: Option<PathBuf>,
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetMetadata {
    pub format: AssetFormat,
    pub record: VariantRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            AssetFormat::from_path(Path::new("a/photo.JPG")),
            Some(AssetFormat::Jpeg)
        );
        assert_eq!(
            AssetFormat::from_path(Path::new("photo.png")),
            Some(AssetFormat::Png)
        );
        assert_eq!(
            AssetFormat::from_path(Path::new("photo.webp")),
            Some(AssetFormat::WebP)
        );
        assert_eq!(
            AssetFormat::from_path(Path::new("photo.avif")),
            Some(AssetFormat::Avif)
        );
        assert_eq!(AssetFormat::from_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn test_variant_label_serde() {
        let json = serde_json::to_string(&VariantLabel::Custom(2)).unwrap();
        assert_eq!(json, "\"custom-2\"");
        let label: VariantLabel = serde_json::from_str("\"thumbnail\"").unwrap();
        assert_eq!(label, VariantLabel::Thumbnail);
        assert!(serde_json::from_str::<VariantLabel>("\"custom-9\"").is_err());
    }

    #[test]
    fn test_extension_sets() {
        assert!(is_recognized_extension("jpeg"));
        assert!(is_recognized_extension("avif"));
        assert!(!is_recognized_extension("gif"));
        assert!(is_legacy_extension("png"));
        assert!(!is_legacy_extension("webp"));
    }

    #[test]
    fn test_variant_paths_are_siblings_of_main_file() {
        let mut asset = Asset::new(AssetId(1), PathBuf::from("/up/2024/05/photo.png")).unwrap();
        asset.variants.push(Variant {
            label: VariantLabel::Thumbnail,
            file: "photo-150x150.webp".into(),
            width: 150,
            height: 150,
            mime: "image/webp".into(),
        });
        let paths: Vec<_> = asset.variant_paths().collect();
        assert_eq!(paths, vec![PathBuf::from("/up/2024/05/photo-150x150.webp")]);
    }
}
