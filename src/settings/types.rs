use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Converted output formats. WebP is the baseline target, AVIF the advanced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    WebP,
    Avif,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 2] = [TargetFormat::WebP, TargetFormat::Avif];

    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::WebP => "webp",
            TargetFormat::Avif => "avif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TargetFormat::WebP => "image/webp",
            TargetFormat::Avif => "image/avif",
        }
    }

    #[allow(dead_code)]
    pub fn image_format(&self) -> ImageFormat {
        match self {
            TargetFormat::WebP => ImageFormat::WebP,
            TargetFormat::Avif => ImageFormat::Avif,
        }
    }

    /// The converted format that is not `self`.
    pub fn other(&self) -> TargetFormat {
        match self {
            TargetFormat::WebP => TargetFormat::Avif,
            TargetFormat::Avif => TargetFormat::WebP,
        }
    }

    pub fn from_advanced_flag(advanced: bool) -> Self {
        if advanced {
            TargetFormat::Avif
        } else {
            TargetFormat::WebP
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Which axis the configured dimensions constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    Width,
    Height,
}

impl ResizeMode {
    /// Extent of `(width, height)` along this axis.
    pub fn extent(&self, width: u32, height: u32) -> u32 {
        match self {
            ResizeMode::Width => width,
            ResizeMode::Height => height,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResizeMode::Width => "width",
            ResizeMode::Height => "height",
        }
    }
}

impl fmt::Display for ResizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResizeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "width" => Ok(ResizeMode::Width),
            "height" => Ok(ResizeMode::Height),
            other => Err(format!("unknown resize mode '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_follows_axis() {
        assert_eq!(ResizeMode::Width.extent(2000, 1500), 2000);
        assert_eq!(ResizeMode::Height.extent(2000, 1500), 1500);
    }

    #[test]
    fn test_resize_mode_parsing() {
        assert_eq!("Width".parse::<ResizeMode>(), Ok(ResizeMode::Width));
        assert_eq!(" height ".parse::<ResizeMode>(), Ok(ResizeMode::Height));
        assert!("diagonal".parse::<ResizeMode>().is_err());
    }

    #[test]
    fn test_other_format() {
        assert_eq!(TargetFormat::WebP.other(), TargetFormat::Avif);
        assert_eq!(TargetFormat::Avif.other(), TargetFormat::WebP);
        assert_eq!(TargetFormat::from_advanced_flag(true), TargetFormat::Avif);
    }
}
