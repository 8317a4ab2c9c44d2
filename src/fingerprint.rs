use crate::assets::{Asset, AssetFormat, Fingerprint};
use crate::settings::ConversionOptions;

/// Decides whether an asset's variants were produced under the active options.
#[derive(Debug, Clone)]
pub struct FingerprintTracker {
    active: Fingerprint,
}

impl FingerprintTracker {
    pub fn new(options: &ConversionOptions) -> Self {
        Self {
            active: options.fingerprint(),
        }
    }

    /// True only when the stored fingerprint equals the active one field for
    /// field and the asset already points at the target format.
    pub fn is_up_to_date(&self, asset: &Asset) -> bool {
        asset.format == AssetFormat::from(self.active.format)
            && asset.fingerprint.as_ref() == Some(&self.active)
    }
}
