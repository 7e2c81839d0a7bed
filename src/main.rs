mod acquisition_manager;
mod config;
mod db_manager;
mod image_audit;
mod image_pipeline;
mod manifest;
mod protocol;
mod slug;
#[cfg(feature = "svg")]
mod svg_rasterizer;
mod title_candidates;
mod wikipedia_client;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error;

use acquisition_manager::ImageAcquisitionManager;
use config::{load_config, ConfigError, FetchConfig};
use db_manager::{DbManager, StoreError};
use image_pipeline::{FsBlobStore, ImageNormalizer};
use manifest::{save_manifest, RunSummary};
use wikipedia_client::WikimediaClient;

#[derive(Parser, Debug)]
#[command(name = "fruitstand-images")]
#[command(about = "Fetches and normalizes fruit images for the fruit facts database")]
#[command(version)]
struct Cli {
    /// Config file; defaults to ./fruitstand-images.toml, then the user config dir
    #[arg(short, long, global = true, env = "FRUITSTAND_IMAGES_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up, download and store an image for every fruit fact
    Fetch {
        /// SQLite database with countries and fruit_facts
        #[arg(long)]
        db: Option<PathBuf>,

        /// Directory receiving images and the manifest
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Process at most this many facts
        #[arg(long, conflicts_with = "all")]
        limit: Option<u32>,

        /// Process every fact, ignoring the configured limit
        #[arg(long)]
        all: bool,
    },
    /// Convert every image in a directory to JPEG and report what cannot be
    Audit {
        dir: PathBuf,
    },
}

#[derive(Debug, Error)]
enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot write manifest {path}: {source}")]
    Manifest { path: PathBuf, source: io::Error },
    #[error("cannot read image directory {path}: {source}")]
    AuditDir { path: PathBuf, source: io::Error },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let mut clog = colog::default_builder();
    clog.filter(None, level);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
}

fn build_normalizer(config: &FetchConfig, store: FsBlobStore) -> ImageNormalizer {
    let normalizer = ImageNormalizer::new(Box::new(store), config);
    #[cfg(feature = "svg")]
    let normalizer =
        normalizer.with_rasterizer(Box::new(svg_rasterizer::ResvgRasterizer::default()));
    if !normalizer.has_rasterizer() {
        info!("Built without SVG support; SVG images will be reported, not converted");
    }
    normalizer
}

fn run_fetch(
    mut config: FetchConfig,
    db: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    limit: Option<u32>,
    all: bool,
) -> Result<RunSummary, FatalError> {
    if let Some(db) = db {
        config.database_path = db;
    }
    if let Some(output_dir) = output_dir {
        config.output_dir = output_dir;
    }
    if all {
        config.subject_limit = None;
    } else if limit.is_some() {
        config.subject_limit = limit;
    }

    let store = FsBlobStore::new(&config.output_dir);
    store.ensure_root().map_err(|source| FatalError::OutputDir {
        path: config.output_dir.clone(),
        source,
    })?;

    let db_manager = DbManager::open(&config.database_path)?;
    let subjects = db_manager.list_subjects(config.subject_limit)?;
    info!(
        "Fetching images for {} fruit facts from {}",
        subjects.len(),
        db_manager.path().display()
    );

    let normalizer = build_normalizer(&config, store);
    let manager = ImageAcquisitionManager::new(
        &config,
        Box::new(WikimediaClient::new(&config)),
        Box::new(WikimediaClient::new(&config)),
        normalizer,
        Box::new(db_manager),
    );
    let ledger = manager.run(&subjects);

    let manifest_path = config.manifest_path();
    save_manifest(&manifest_path, &ledger).map_err(|source| FatalError::Manifest {
        path: manifest_path.clone(),
        source,
    })?;
    info!("Wrote manifest to {}", manifest_path.display());
    Ok(RunSummary::from_ledger(&ledger))
}

fn run_audit(config: &FetchConfig, dir: PathBuf) -> Result<bool, FatalError> {
    let normalizer = build_normalizer(config, FsBlobStore::new(&dir));
    let entries = image_audit::audit_directory(&dir, &normalizer)
        .map_err(|source| FatalError::AuditDir { path: dir, source })?;
    println!("{}", image_audit::render_report(&entries));
    Ok(image_audit::has_problems(&entries))
}

fn run(cli: Cli) -> Result<ExitCode, FatalError> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Fetch {
            db,
            output_dir,
            limit,
            all,
        } => {
            let summary = run_fetch(config, db, output_dir, limit, all)?;
            println!("{}", summary.render());
            Ok(ExitCode::SUCCESS)
        }
        Command::Audit { dir } => {
            if run_audit(&config, dir)? {
                warn!("Some files need attention");
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
