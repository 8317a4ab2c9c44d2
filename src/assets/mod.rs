// Assets module - data model and the repository collaborator
mod json_store;
mod types;

pub use json_store::JsonAssetRepository;
pub use types::*;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

use crate::error::RepositoryError;

/// Enumerates assets and persists their file/format/variant records.
///
/// Pages are ordered by ascending id; excluded ids are removed before the offset
/// is applied, so offsets count only eligible assets.
pub trait AssetRepository: Send + Sync {
    fn list_page(
        &self,
        offset: usize,
        limit: usize,
        excluding: &BTreeSet<AssetId>,
    ) -> Result<Vec<AssetRef>, RepositoryError>;

    fn get_file(&self, id: AssetId) -> Result<PathBuf, RepositoryError>;

    fn get_metadata(&self, id: AssetId) -> Result<AssetMetadata, RepositoryError>;

    fn set_file(&self, id: AssetId, path: &Path) -> Result<(), RepositoryError>;

    fn set_format(&self, id: AssetId, format: AssetFormat) -> Result<(), RepositoryError>;

    fn set_metadata(&self, id: AssetId, record: VariantRecord) -> Result<(), RepositoryError>;

    fn insert(&self, asset: Asset) -> Result<(), RepositoryError>;

    fn remove(&self, id: AssetId) -> Result<Option<Asset>, RepositoryError>;

    fn count(&self) -> Result<usize, RepositoryError>;

    /// Full asset view assembled from the file and metadata lookups.
    fn load(&self, id: AssetId) -> Result<Asset, RepositoryError> {
        let file = self.get_file(id)?;
        let metadata = self.get_metadata(id)?;
        let mut asset = Asset {
            id,
            file,
            format: metadata.format,
            variants: Vec::new(),
            fingerprint: None,
            original_file: None,
            restored: false,
        };
        asset.apply_record(metadata.record);
        Ok(asset)
    }

    /// Write back a successful conversion. Stores that persist on every call may
    /// override this to write once.
    ///
    /// When one of the writes fails the previous file, format and record are
    /// put back, so the asset never ends up half converted.
    fn commit(
        &self,
        id: AssetId,
        file: &Path,
        format: AssetFormat,
        record: VariantRecord,
    ) -> Result<(), RepositoryError> {
        let prior_file = self.get_file(id)?;
        let prior = self.get_metadata(id)?;

        let result = self
            .set_file(id, file)
            .and_then(|_| self.set_format(id, format))
            .and_then(|_| self.set_metadata(id, record));
        if let Err(e) = &result {
            warn!("Commit of {} failed ({}), restoring its previous record", id, e);
            let restored = self
                .set_file(id, &prior_file)
                .and_then(|_| self.set_format(id, prior.format))
                .and_then(|_| self.set_metadata(id, prior.record));
            if let Err(e) = restored {
                warn!("Could not restore the record of {}: {}", id, e);
            }
        }
        result
    }
}

/// Ordered in-memory asset table shared by the repository implementations.
#[derive(Debug, Default)]
pub(crate) struct AssetIndex {
    assets: BTreeMap<AssetId, Asset>,
}

impl AssetIndex {
    pub(crate) fn from_assets(assets: Vec<Asset>) -> Self {
        Self {
            assets: assets.into_iter().map(|a| (a.id, a)).collect(),
        }
    }

    pub(crate) fn to_vec(&self) -> Vec<Asset> {
        self.assets.values().cloned().collect()
    }

    fn page(&self, offset: usize, limit: usize, excluding: &BTreeSet<AssetId>) -> Vec<AssetRef> {
        self.assets
            .values()
            .filter(|a| !excluding.contains(&a.id))
            .skip(offset)
            .take(limit)
            .map(|a| AssetRef {
                id: a.id,
                file: a.file.clone(),
                format: a.format,
            })
            .collect()
    }

    fn get(&self, id: AssetId) -> Result<&Asset, RepositoryError> {
        self.assets.get(&id).ok_or(RepositoryError::NotFound(id))
    }

    fn get_mut(&mut self, id: AssetId) -> Result<&mut Asset, RepositoryError> {
        self.assets.get_mut(&id).ok_or(RepositoryError::NotFound(id))
    }

    fn insert(&mut self, asset: Asset) -> Result<(), RepositoryError> {
        if self.assets.contains_key(&asset.id) {
            return Err(RepositoryError::Duplicate(asset.id));
        }
        self.assets.insert(asset.id, asset);
        Ok(())
    }

    fn remove(&mut self, id: AssetId) -> Option<Asset> {
        self.assets.remove(&id)
    }

    fn len(&self) -> usize {
        self.assets.len()
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::IoError(std::io::Error::other("asset index lock poisoned"))
}

/// Volatile repository, used by tests and by hosts that keep their own storage.
#[derive(Debug, Default)]
pub struct MemoryAssetRepository {
    index: RwLock<AssetIndex>,
}

impl MemoryAssetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: Vec<Asset>) -> Self {
        Self {
            index: RwLock::new(AssetIndex::from_assets(assets)),
        }
    }
}

impl AssetRepository for MemoryAssetRepository {
    fn list_page(
        &self,
        offset: usize,
        limit: usize,
        excluding: &BTreeSet<AssetId>,
    ) -> Result<Vec<AssetRef>, RepositoryError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index.page(offset, limit, excluding))
    }

    fn get_file(&self, id: AssetId) -> Result<PathBuf, RepositoryError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index.get(id)?.file.clone())
    }

    fn get_metadata(&self, id: AssetId) -> Result<AssetMetadata, RepositoryError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        let asset = index.get(id)?;
        Ok(AssetMetadata {
            format: asset.format,
            record: asset.record(),
        })
    }

    fn set_file(&self, id: AssetId, path: &Path) -> Result<(), RepositoryError> {
        let mut index = self.index.write().map_err(|_| poisoned())?;
        index.get_mut(id)?.file = path.to_path_buf();
        Ok(())
    }

    fn set_format(&self, id: AssetId, format: AssetFormat) -> Result<(), RepositoryError> {
        let mut index = self.index.write().map_err(|_| poisoned())?;
        index.get_mut(id)?.format = format;
        Ok(())
    }

    fn set_metadata(&self, id: AssetId, record: VariantRecord) -> Result<(), RepositoryError> {
        let mut index = self.index.write().map_err(|_| poisoned())?;
        index.get_mut(id)?.apply_record(record);
        Ok(())
    }

    fn insert(&self, asset: Asset) -> Result<(), RepositoryError> {
        let mut index = self.index.write().map_err(|_| poisoned())?;
        index.insert(asset)
    }

    fn remove(&self, id: AssetId) -> Result<Option<Asset>, RepositoryError> {
        let mut index = self.index.write().map_err(|_| poisoned())?;
        Ok(index.remove(id))
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(id: u64) -> Asset {
        Asset::new(AssetId(id), PathBuf::from(format!("/up/2024/01/img{}.jpg", id))).unwrap()
    }

    #[test]
    fn test_pages_skip_excluded_before_offset() {
        let repo = MemoryAssetRepository::with_assets((1..=6).map(asset).collect());
        let excluded: BTreeSet<_> = [AssetId(2), AssetId(3)].into_iter().collect();

        let first: Vec<_> = repo
            .list_page(0, 2, &excluded)
            .unwrap()
            .into_iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(first, vec![1, 4]);

        let second: Vec<_> = repo
            .list_page(2, 2, &excluded)
            .unwrap()
            .into_iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(second, vec![5, 6]);

        assert!(repo.list_page(4, 2, &excluded).unwrap().is_empty());
    }

    #[test]
    fn test_commit_updates_every_field() {
        let repo = MemoryAssetRepository::with_assets(vec![asset(1)]);
        let record = VariantRecord {
            original_file: Some(PathBuf::from("/up/2024/01/img1.jpg")),
            ..Default::default()
        };
        repo.commit(
            AssetId(1),
            Path::new("/up/2024/01/img1.webp"),
            AssetFormat::WebP,
            record.clone(),
        )
        .unwrap();

        let loaded = repo.load(AssetId(1)).unwrap();
        assert_eq!(loaded.file, PathBuf::from("/up/2024/01/img1.webp"));
        assert_eq!(loaded.format, AssetFormat::WebP);
        assert_eq!(loaded.record(), record);
    }

    #[test]
    fn test_missing_asset_is_reported() {
        let repo = MemoryAssetRepository::new();
        assert!(matches!(
            repo.get_file(AssetId(42)),
            Err(RepositoryError::NotFound(AssetId(42)))
        ));
        assert!(matches!(
            repo.insert(asset(1)).and_then(|_| repo.insert(asset(1))),
            Err(RepositoryError::Duplicate(AssetId(1)))
        ));
    }
}
