use image::{ImageBuffer, Rgb};
use imgpress::assets::{Asset, AssetFormat, AssetId, AssetRepository, MemoryAssetRepository};
use imgpress::error::ConversionError;
use imgpress::image_processing::{
    CodecRegistry, EditorBackend, ImageEditor, ImageRsBackend, ImageSize,
};
use imgpress::log_sink::{BoundedLog, LogLevel};
use imgpress::memory::FixedProbe;
use imgpress::settings::{MemorySettingsStore, SettingValue, Settings, SettingsStore, TargetFormat, keys};
use imgpress::{Pipeline, PipelineError, RunLock, SingleResult, Trigger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Helper holding an asset tree laid out as `<root>/2024/05/<file>`
struct TestTree {
    _temp_dir: TempDir,
    root: PathBuf,
    state_dir: PathBuf,
    dir: PathBuf,
    settings: Arc<MemorySettingsStore>,
    repository: Arc<MemoryAssetRepository>,
    log: Arc<BoundedLog>,
}

impl TestTree {
    fn new(count: u64) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("uploads");
        let dir = root.join("2024").join("05");
        std::fs::create_dir_all(&dir).unwrap();

        let mut assets = Vec::new();
        for id in 1..=count {
            let path = dir.join(format!("img{}.png", id));
            write_png(&path, 64, 48);
            assets.push(Asset::new(AssetId(id), path).unwrap());
        }

        let settings = Arc::new(MemorySettingsStore::new());
        settings
            .set(keys::DIMENSIONS, SettingValue::List(vec![64, 32]))
            .unwrap();

        Self {
            state_dir: temp_dir.path().join("state"),
            _temp_dir: temp_dir,
            root,
            dir,
            settings,
            repository: Arc::new(MemoryAssetRepository::with_assets(assets)),
            log: Arc::new(BoundedLog::new()),
        }
    }

    fn pipeline(&self) -> Pipeline {
        self.builder().build()
    }

    fn builder(&self) -> imgpress::PipelineBuilder {
        Pipeline::builder(
            self.root.clone(),
            self.state_dir.clone(),
            self.settings.clone(),
            self.repository.clone(),
            self.log.clone(),
        )
        .memory_probe(Arc::new(FixedProbe::constant(0.1)))
    }

    fn set(&self, key: &str, value: SettingValue) {
        self.settings.set(key, value).unwrap();
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn entries_at(&self, level: LogLevel, needle: &str) -> usize {
        self.log
            .entries()
            .iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .count()
    }
}

fn write_png(path: &Path, width: u32, height: u32) {
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 90u8])
    });
    image.save(path).unwrap();
}

fn run_until_done(pipeline: &Pipeline) -> Vec<imgpress::batch::BatchReport> {
    let mut reports = Vec::new();
    for _ in 0..20 {
        let report = pipeline.resume().unwrap();
        let done = report.done;
        reports.push(report);
        if done {
            return reports;
        }
    }
    panic!("batch never finished");
}

#[test]
fn test_full_pass_converts_every_asset() {
    let tree = TestTree::new(3);
    tree.set(keys::BATCH_SIZE, SettingValue::Int(2));
    let pipeline = tree.pipeline();

    let reports = run_until_done(&pipeline);
    let converted: usize = reports.iter().map(|r| r.stats.converted).sum();
    assert_eq!(converted, 3);

    assert_eq!(
        tree.files(),
        vec![
            "img1-150x150.webp",
            "img1-32.webp",
            "img1.webp",
            "img2-150x150.webp",
            "img2-32.webp",
            "img2.webp",
            "img3-150x150.webp",
            "img3-32.webp",
            "img3.webp",
        ]
    );

    let asset = tree.repository.load(AssetId(2)).unwrap();
    assert_eq!(asset.file, tree.file("img2.webp"));
    assert_eq!(asset.format, AssetFormat::WebP);
    assert_eq!(asset.variants.len(), 3);
    assert_eq!(asset.original_file, None);
    assert!(asset.variant_paths().all(|p| p.exists()));

    // Offset resets once the pass is complete
    let settings = Settings::load(tree.settings.as_ref()).unwrap();
    assert_eq!(tree.settings.get(keys::BATCH_OFFSET), Some(SettingValue::Int(0)));
    assert_eq!(
        tree.settings.get(keys::BATCH_PAGE_SIZE),
        Some(SettingValue::Int(settings.batch_size as i64))
    );
    assert_eq!(tree.entries_at(LogLevel::Info, "Converted"), 3);
}

#[test]
fn test_second_pass_is_a_no_op() {
    let tree = TestTree::new(2);
    let pipeline = tree.pipeline();
    run_until_done(&pipeline);
    let before = tree.files();
    let log_before = tree.log.len();

    let report = pipeline.resume().unwrap();
    assert!(report.done);
    assert_eq!(report.stats.converted, 0);
    assert_eq!(report.stats.up_to_date, 2);
    assert_eq!(tree.files(), before);
    // Only the completion summary is added
    assert_eq!(tree.log.len(), log_before + 1);
}

#[test]
fn test_changed_dimensions_reconvert_from_preserved_original() {
    let tree = TestTree::new(1);
    tree.set(keys::PRESERVE_ORIGINALS, SettingValue::Bool(true));
    let pipeline = tree.pipeline();
    run_until_done(&pipeline);

    let asset = tree.repository.load(AssetId(1)).unwrap();
    assert_eq!(asset.original_file, Some(tree.file("img1.png")));
    assert!(tree.file("img1.png").exists());

    tree.set(keys::DIMENSIONS, SettingValue::List(vec![48, 16]));
    let report = pipeline.resume().unwrap();
    assert_eq!(report.stats.converted, 1);

    assert_eq!(
        tree.files(),
        vec!["img1-150x150.webp", "img1-16.webp", "img1.png", "img1.webp"]
    );
    let asset = tree.repository.load(AssetId(1)).unwrap();
    assert_eq!((asset.variants[0].width, asset.variants[0].height), (48, 36));
    assert_eq!(asset.fingerprint.as_ref().unwrap().dimensions, vec![48, 16]);
}

#[test]
fn test_excluded_asset_is_never_touched() {
    let tree = TestTree::new(2);
    tree.set(keys::EXCLUDED_ASSET_IDS, SettingValue::List(vec![1]));
    let pipeline = tree.pipeline();

    run_until_done(&pipeline);
    assert_eq!(
        pipeline.convert_one(AssetId(1), Trigger::Manual).unwrap(),
        SingleResult::Excluded
    );

    let asset = tree.repository.load(AssetId(1)).unwrap();
    assert_eq!(asset.file, tree.file("img1.png"));
    assert!(asset.variants.is_empty());
    assert!(tree.file("img1.png").exists());
    assert!(!tree.file("img1.webp").exists());
    assert!(tree.file("img2.webp").exists());
}

#[test]
fn test_upload_trigger_honours_disable_auto_convert() {
    let tree = TestTree::new(1);
    tree.set(keys::DISABLE_AUTO_CONVERT, SettingValue::Bool(true));
    let pipeline = tree.pipeline();

    assert_eq!(
        pipeline.convert_one(AssetId(1), Trigger::Upload).unwrap(),
        SingleResult::AutoConvertDisabled
    );
    assert!(!tree.file("img1.webp").exists());

    assert_eq!(
        pipeline.convert_one(AssetId(1), Trigger::Manual).unwrap(),
        SingleResult::Converted
    );
    assert!(tree.file("img1.webp").exists());
    assert_eq!(
        pipeline.convert_one(AssetId(1), Trigger::Manual).unwrap(),
        SingleResult::UpToDate
    );
}

#[test]
fn test_concurrent_run_is_refused() {
    let tree = TestTree::new(1);
    let pipeline = tree.pipeline();

    let held = RunLock::acquire(&tree.state_dir).unwrap();
    assert!(matches!(pipeline.resume(), Err(PipelineError::Busy(_))));
    assert!(matches!(pipeline.reconcile(100), Err(PipelineError::Busy(_))));
    assert!(!tree.file("img1.webp").exists());

    drop(held);
    assert!(pipeline.resume().unwrap().done);
    assert!(tree.file("img1.webp").exists());
}

#[test]
fn test_lock_left_by_dead_process_does_not_block() {
    let tree = TestTree::new(1);
    std::fs::create_dir_all(&tree.state_dir).unwrap();
    let lock_path = tree.state_dir.join("imgpress.lock");
    std::fs::write(&lock_path, format!("{}\n", u32::MAX - 1)).unwrap();

    let pipeline = tree.pipeline();
    assert!(pipeline.resume().unwrap().done);
    assert!(tree.file("img1.webp").exists());
    assert!(!lock_path.exists());
}

#[test]
fn test_restore_original_drops_variants_and_excludes_asset() {
    let tree = TestTree::new(1);
    tree.set(keys::PRESERVE_ORIGINALS, SettingValue::Bool(true));
    let pipeline = tree.pipeline();
    run_until_done(&pipeline);

    let removed = pipeline.restore_original(AssetId(1)).unwrap();
    assert_eq!(removed, 3);
    assert_eq!(tree.files(), vec!["img1.png"]);

    let asset = tree.repository.load(AssetId(1)).unwrap();
    assert_eq!(asset.file, tree.file("img1.png"));
    assert_eq!(asset.format, AssetFormat::Png);
    assert!(asset.restored);
    assert!(asset.variants.is_empty());

    let settings = Settings::load(tree.settings.as_ref()).unwrap();
    assert!(settings.excluded.contains(&AssetId(1)));

    // A later pass leaves it alone
    let report = pipeline.resume().unwrap();
    assert_eq!(report.stats.converted, 0);
    assert_eq!(tree.files(), vec!["img1.png"]);
}

#[test]
fn test_restore_without_original_fails() {
    let tree = TestTree::new(1);
    let pipeline = tree.pipeline();
    run_until_done(&pipeline);

    assert!(pipeline.restore_original(AssetId(1)).is_err());
    assert!(tree.file("img1.webp").exists());
}

#[test]
fn test_deleted_asset_takes_its_files_along() {
    let tree = TestTree::new(2);
    tree.set(keys::PRESERVE_ORIGINALS, SettingValue::Bool(true));
    tree.set(keys::EXCLUDED_ASSET_IDS, SettingValue::List(vec![2]));
    let pipeline = tree.pipeline();
    run_until_done(&pipeline);

    assert_eq!(pipeline.on_asset_deleted(AssetId(1)).unwrap(), 4);
    assert_eq!(pipeline.on_asset_deleted(AssetId(2)).unwrap(), 1);
    assert!(tree.files().is_empty());
    assert_eq!(tree.repository.count().unwrap(), 0);

    let settings = Settings::load(tree.settings.as_ref()).unwrap();
    assert!(settings.excluded.is_empty());

    // Unknown ids are not an error
    assert_eq!(pipeline.on_asset_deleted(AssetId(9)).unwrap(), 0);
}

#[test]
fn test_failed_encode_rolls_back_and_keeps_source() {
    let tree = TestTree::new(1);
    let registry = CodecRegistry::empty().with_backend(Arc::new(FailOnSave::new(2)));
    let pipeline = tree.builder().registry(registry).build();

    let report = pipeline.resume().unwrap();
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.converted, 0);

    assert_eq!(tree.files(), vec!["img1.png"]);
    let asset = tree.repository.load(AssetId(1)).unwrap();
    assert_eq!(asset.file, tree.file("img1.png"));
    assert!(asset.fingerprint.is_none());
    assert_eq!(tree.entries_at(LogLevel::Error, "Rolled back"), 1);
}

#[test]
fn test_sustained_memory_pressure_stops_the_run() {
    let tree = TestTree::new(8);
    tree.set(keys::BATCH_SIZE, SettingValue::Int(1));
    let pipeline = tree
        .builder()
        .memory_probe(Arc::new(FixedProbe::constant(0.95)))
        .build();

    let mut last = None;
    for _ in 0..8 {
        let report = pipeline.resume().unwrap();
        let stop = report.aborted || report.done;
        last = Some(report);
        if stop {
            break;
        }
    }

    let report = last.unwrap();
    assert!(report.aborted);
    assert!(!report.done);
    assert_eq!(report.stats.converted, 0);
    assert_eq!(report.next_offset, 5);
    assert_eq!(tree.settings.get(keys::BATCH_OFFSET), Some(SettingValue::Int(5)));
    assert!(tree.file("img5.webp").exists());
    assert!(!tree.file("img6.webp").exists());
    assert_eq!(tree.entries_at(LogLevel::Warn, "memory stayed above"), 1);
}

#[test]
fn test_import_then_convert() {
    let tree = TestTree::new(0);
    write_png(&tree.file("new.png"), 40, 40);
    let pipeline = tree.pipeline();

    let report = pipeline.import().unwrap();
    assert_eq!(report.registered, vec![AssetId(1)]);

    run_until_done(&pipeline);
    assert_eq!(
        tree.files(),
        vec!["new-150x150.webp", "new-32.webp", "new.webp"]
    );
}

#[cfg(feature = "avif")]
#[test]
fn test_format_switch_replaces_variants() {
    let tree = TestTree::new(1);
    tree.set(keys::PRESERVE_ORIGINALS, SettingValue::Bool(true));
    let pipeline = tree.pipeline();
    run_until_done(&pipeline);

    tree.set(keys::TARGET_FORMAT_IS_ADVANCED, SettingValue::Bool(true));
    let report = pipeline.resume().unwrap();
    assert_eq!(report.stats.converted, 1);

    assert_eq!(
        tree.files(),
        vec!["img1-150x150.avif", "img1-32.avif", "img1.avif", "img1.png"]
    );
    let asset = tree.repository.load(AssetId(1)).unwrap();
    assert_eq!(asset.format, AssetFormat::Avif);
    assert!(asset.variants.iter().all(|v| v.mime == TargetFormat::Avif.mime_type()));
}

/// Backend that fails the N-th save after writing a truncated file.
struct FailOnSave {
    inner: ImageRsBackend,
    fail_on: usize,
    saves: Arc<AtomicUsize>,
}

impl FailOnSave {
    fn new(fail_on: usize) -> Self {
        Self {
            inner: ImageRsBackend::default(),
            fail_on,
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl EditorBackend for FailOnSave {
    fn name(&self) -> &'static str {
        "fail-on-save"
    }

    fn supports(&self, format: TargetFormat) -> bool {
        self.inner.supports(format)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn ImageEditor>, ConversionError> {
        Ok(Box::new(FailOnSaveEditor {
            inner: self.inner.open(path)?,
            fail_on: self.fail_on,
            saves: self.saves.clone(),
        }))
    }
}

struct FailOnSaveEditor {
    inner: Box<dyn ImageEditor>,
    fail_on: usize,
    saves: Arc<AtomicUsize>,
}

impl ImageEditor for FailOnSaveEditor {
    fn size(&self) -> ImageSize {
        self.inner.size()
    }

    fn resize(&mut self, width: u32, height: u32, crop: bool) -> Result<(), ConversionError> {
        self.inner.resize(width, height, crop)
    }

    fn save(&self, path: &Path, format: TargetFormat, quality: u8) -> Result<(), ConversionError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            std::fs::write(path, b"RIFF").unwrap();
            return Err(ConversionError::EncodeError("encoder crashed".into()));
        }
        self.inner.save(path, format, quality)
    }
}
