use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use super::{
    Asset, AssetFormat, AssetId, AssetIndex, AssetMetadata, AssetRef, AssetRepository,
    VariantRecord, poisoned,
};
use crate::error::RepositoryError;

/// Asset records stored as one JSON document. Every mutation is written through
/// (temp file + rename), so a record never lags behind the files it describes.
pub struct JsonAssetRepository {
    path: PathBuf,
    index: RwLock<AssetIndex>,
}

impl JsonAssetRepository {
    pub fn open(path: &Path) -> Result<Self, RepositoryError> {
        let assets = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            let assets: Vec<Asset> = serde_json::from_str(&json)?;
            info!("Loaded {} asset records from {:?}", assets.len(), path);
            assets
        } else {
            debug!("Asset index {:?} not found, starting empty", path);
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            index: RwLock::new(AssetIndex::from_assets(assets)),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, AssetIndex>, RepositoryError> {
        self.index.write().map_err(|_| poisoned())
    }

    fn persist(&self, index: &AssetIndex) -> Result<(), RepositoryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&index.to_vec())?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut AssetIndex) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut index = self.write()?;
        let before = index.to_vec();
        let result = f(&mut index)?;
        if let Err(e) = self.persist(&index) {
            // Keep memory in step with what is on disk
            *index = AssetIndex::from_assets(before);
            return Err(e);
        }
        Ok(result)
    }
}

impl AssetRepository for JsonAssetRepository {
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
        self.mutate(|index| {
            index.get_mut(id)?.file = path.to_path_buf();
            Ok(())
        })
    }

    fn set_format(&self, id: AssetId, format: AssetFormat) -> Result<(), RepositoryError> {
        self.mutate(|index| {
            index.get_mut(id)?.format = format;
            Ok(())
        })
    }

    fn set_metadata(&self, id: AssetId, record: VariantRecord) -> Result<(), RepositoryError> {
        self.mutate(|index| {
            index.get_mut(id)?.apply_record(record);
            Ok(())
        })
    }

    fn insert(&self, asset: Asset) -> Result<(), RepositoryError> {
        self.mutate(|index| index.insert(asset))
    }

    fn remove(&self, id: AssetId) -> Result<Option<Asset>, RepositoryError> {
        self.mutate(|index| Ok(index.remove(id)))
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index.len())
    }

    fn commit(
        &self,
        id: AssetId,
        file: &Path,
        format: AssetFormat,
        record: VariantRecord,
    ) -> Result<(), RepositoryError> {
        self.mutate(|index| {
            let asset = index.get_mut(id)?;
            asset.file = file.to_path_buf();
            asset.format = format;
            asset.apply_record(record);
            Ok(())
        })
    }
}
