use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::assets::{Asset, AssetId, AssetRepository, is_legacy_extension, lowercase_extension};
use crate::error::RepositoryError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub registered: Vec<AssetId>,
    pub already_known: usize,
}

/// Register legacy raster files under `root` that no asset refers to yet.
///
/// Uses the same `<root>/<dir>/<file>` and `<root>/<dir>/<dir>/<file>` layout the
/// cleanup pass walks.
pub fn import_tree(
    root: &Path,
    repository: &dyn AssetRepository,
) -> Result<ImportReport, RepositoryError> {
    let mut known: BTreeSet<PathBuf> = BTreeSet::new();
    let mut next_id = 1;
    let none = BTreeSet::new();
    let mut offset = 0;
    loop {
        let page = repository.list_page(offset, 500, &none)?;
        for entry in &page {
            next_id = next_id.max(entry.id.0 + 1);
            let asset = repository.load(entry.id)?;
            known.insert(asset.file.clone());
            known.extend(asset.original_file.clone());
            known.extend(asset.variant_paths());
        }
        if page.len() < 500 {
            break;
        }
        offset += page.len();
    }

    let mut report = ImportReport::default();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(3)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !lowercase_extension(path).is_some_and(|ext| is_legacy_extension(&ext)) {
            continue;
        }
        if known.contains(path) {
            report.already_known += 1;
            continue;
        }

        let Some(asset) = Asset::new(AssetId(next_id), path.to_path_buf()) else {
            continue;
        };
        debug!("Registering {:?} as {}", path, asset.id);
        repository.insert(asset)?;
        report.registered.push(AssetId(next_id));
        known.insert(path.to_path_buf());
        next_id += 1;
    }

    info!(
        "Imported {} new asset(s), {} already known",
        report.registered.len(),
        report.already_known
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetFormat, MemoryAssetRepository};
    use tempfile::TempDir;

    #[test]
    fn test_registers_new_legacy_files_once() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("2024").join("05");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.jpg", "b.PNG", "c.webp", "d.txt"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        std::fs::write(temp_dir.path().join("top.jpg"), b"x").unwrap();

        let existing = Asset::new(AssetId(7), dir.join("a.jpg")).unwrap();
        let repository = MemoryAssetRepository::with_assets(vec![existing]);

        let report = import_tree(temp_dir.path(), &repository).unwrap();
        assert_eq!(report.registered, vec![AssetId(8)]);
        assert_eq!(report.already_known, 1);

        let imported = repository.load(AssetId(8)).unwrap();
        assert_eq!(imported.file, dir.join("b.PNG"));
        assert_eq!(imported.format, AssetFormat::Png);

        let again = import_tree(temp_dir.path(), &repository).unwrap();
        assert!(again.registered.is_empty());
        assert_eq!(again.already_known, 2);
    }
}
