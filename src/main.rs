use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use imgpress::{
    Config, Pipeline, SingleResult, Trigger,
    assets::{AssetId, JsonAssetRepository},
    log_sink::BoundedLog,
    memory::SysinfoProbe,
    settings::{SettingValue, Settings, SettingsStore, TomlSettingsStore},
    startup_checks,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Global options that apply to all commands
    #[arg(short, long, default_value = "imgpress.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert pages of assets until every asset is up to date
    Convert {
        /// Stop after this many pages
        #[arg(long)]
        pages: Option<usize>,

        /// Start from the first asset instead of the saved offset
        #[arg(long)]
        restart: bool,
    },

    /// Convert a single asset
    ConvertOne {
        id: u64,

        /// Treat as an upload, honouring disable-auto-convert
        #[arg(long)]
        upload: bool,
    },

    /// Remove leftover files no asset needs
    Cleanup {
        /// Files examined per pass
        #[arg(long, default_value_t = 1000)]
        batch_limit: usize,

        /// Keep going until the whole tree was walked
        #[arg(long)]
        all: bool,
    },

    /// Restore an asset to its retained original
    Restore { id: u64 },

    /// Forget an asset and delete all of its files
    Forget { id: u64 },

    /// Register legacy images under the storage root as assets
    Import,

    /// Inspect or change conversion settings
    #[command(subcommand)]
    Settings(SettingsCommands),

    /// Print the operator log
    Log {
        /// Only the most recent entries
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print every stored setting
    Show,
    /// Set one setting, e.g. `dimensions 1920,1200,600`
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging first
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Settings(cmd) => handle_settings_command(&config, cmd),
        Commands::Log { tail } => {
            let log = BoundedLog::load(&config.storage.log_path())?;
            let entries = log.entries();
            let skip = tail.map_or(0, |n| entries.len().saturating_sub(n));
            for entry in entries.iter().skip(skip) {
                println!("{}", entry);
            }
            Ok(())
        }
        command => run_pipeline_command(config, command).await,
    }
}

fn load_config(config_path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if config_path.exists() {
        let config_content = std::fs::read_to_string(config_path)?;
        let config = toml_edit::de::from_str::<Config>(&config_content)?;
        info!("Configuration loaded from: {:?}", config_path);
        Ok(config)
    } else {
        info!("Config file not found at {:?}, using defaults", config_path);
        Ok(Config::default())
    }
}

fn handle_settings_command(
    config: &Config,
    cmd: SettingsCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.storage.state_directory)?;
    let store = TomlSettingsStore::open(&config.storage.settings_path())?;

    match cmd {
        SettingsCommands::Show => {
            let settings = Settings::load(&store)?;
            println!("{:#?}", settings);
            let stored = store.render();
            if !stored.trim().is_empty() {
                println!("\n# {}\n{}", store.path().display(), stored);
            }
        }
        SettingsCommands::Set { key, value } => {
            let previous = store.get(&key);
            store.set(&key, parse_setting(&value))?;
            if let Err(e) = Settings::load(&store) {
                // Put the old value back so the store stays loadable
                if let Some(previous) = previous {
                    store.set(&key, previous)?;
                }
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
            println!("Set {} = {}", key, value);
        }
    }
    Ok(())
}

fn parse_setting(raw: &str) -> SettingValue {
    let raw = raw.trim();
    match raw {
        "true" => return SettingValue::Bool(true),
        "false" => return SettingValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return SettingValue::Int(n);
    }
    let list = raw.trim_start_matches('[').trim_end_matches(']');
    if list.contains(',') || list.is_empty() {
        let parsed: Result<Vec<i64>, _> = list
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse::<i64>)
            .collect();
        if let Ok(values) = parsed {
            return SettingValue::List(values);
        }
    }
    SettingValue::Text(raw.to_string())
}

async fn run_pipeline_command(
    config: Config,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    // Perform startup checks
    if let Err(errors) = startup_checks::perform_startup_checks(&config).await {
        for error in &errors {
            tracing::error!("Startup check failed: {}", error);
        }
        if errors.iter().any(|e| e.is_critical()) {
            tracing::error!("Critical startup check failed, exiting");
            return Err("Critical startup check failed".into());
        }
        tracing::warn!("Non-critical startup checks failed, continuing");
    }

    let log = Arc::new(BoundedLog::load(&config.storage.log_path())?);
    let settings = Arc::new(TomlSettingsStore::open(&config.storage.settings_path())?);
    let repository = Arc::new(JsonAssetRepository::open(&config.storage.assets_path())?);
    let cancel = Arc::new(AtomicBool::new(false));

    let pipeline = Arc::new(
        Pipeline::builder(
            config.storage.root.clone(),
            config.storage.state_directory.clone(),
            settings,
            repository,
            log.clone(),
        )
        .registry(config.codecs.registry())
        .memory_probe(Arc::new(SysinfoProbe::new(config.memory.limit_mb)))
        .memory_threshold(config.memory.threshold_fraction)
        .retry(config.deletion.retry_policy())
        .thumbnail_size(config.codecs.thumbnail_size)
        .cancel_flag(cancel.clone())
        .build(),
    );

    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = match command {
        Commands::Convert { pages, restart } => convert_all(pipeline, pages, restart).await,
        Commands::ConvertOne { id, upload } => {
            let trigger = if upload { Trigger::Upload } else { Trigger::Manual };
            let p = pipeline.clone();
            let result =
                tokio::task::spawn_blocking(move || p.convert_one(AssetId(id), trigger)).await??;
            match result {
                SingleResult::Converted => println!("Converted asset {}", id),
                other => println!("Asset {} not converted: {:?}", id, other),
            }
            Ok(())
        }
        Commands::Cleanup { batch_limit, all } => {
            loop {
                let p = pipeline.clone();
                let report =
                    tokio::task::spawn_blocking(move || p.reconcile(batch_limit)).await??;
                println!(
                    "Examined {} file(s): {} deleted, {} failed",
                    report.processed, report.deleted, report.failed
                );
                if report.completed {
                    println!("Cleanup complete");
                    break;
                }
                if !all || report.cancelled || cancel.load(Ordering::Relaxed) {
                    println!("Cleanup will resume at file {}", report.next_cursor);
                    break;
                }
            }
            Ok(())
        }
        Commands::Restore { id } => {
            let p = pipeline.clone();
            let removed =
                tokio::task::spawn_blocking(move || p.restore_original(AssetId(id))).await??;
            println!("Restored asset {}, removed {} converted file(s)", id, removed);
            Ok(())
        }
        Commands::Forget { id } => {
            let p = pipeline.clone();
            let removed =
                tokio::task::spawn_blocking(move || p.on_asset_deleted(AssetId(id))).await??;
            println!("Forgot asset {}, removed {} file(s)", id, removed);
            Ok(())
        }
        Commands::Import => {
            let p = pipeline.clone();
            let report = tokio::task::spawn_blocking(move || p.import()).await??;
            println!(
                "Registered {} new asset(s), {} already known",
                report.registered.len(),
                report.already_known
            );
            Ok(())
        }
        Commands::Settings(_) | Commands::Log { .. } => Ok(()),
    };

    info!("Saving operator log");
    if let Err(e) = log.save(&config.storage.log_path()) {
        tracing::error!("Failed to save log: {}", e);
    }
    result
}

async fn convert_all(
    pipeline: Arc<Pipeline>,
    pages: Option<usize>,
    restart: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut page = 0;
    loop {
        let p = pipeline.clone();
        let report = tokio::task::spawn_blocking(move || -> Result<_, imgpress::PipelineError> {
            if restart && page == 0 {
                let settings = Settings::load(p.settings().as_ref())?;
                p.run_batch(0, settings.batch_size)
            } else {
                p.resume()
            }
        })
        .await??;
        page += 1;

        println!(
            "Assets {}..{}: {} converted, {} up to date, {} skipped, {} failed",
            report.start_offset,
            report.next_offset,
            report.stats.converted,
            report.stats.up_to_date,
            report.stats.skipped,
            report.stats.failed
        );

        if report.done {
            println!("All assets processed");
            break;
        }
        if report.cancelled || report.aborted || pages.is_some_and(|max| page >= max) {
            if report.aborted {
                println!("Stopped under memory pressure");
            }
            println!("Conversion will resume at asset offset {}", report.next_offset);
            break;
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: Arc<AtomicBool>) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C), finishing the current asset");
        },
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM), finishing the current asset");
        },
    }
    cancel.store(true, Ordering::Relaxed);
}
