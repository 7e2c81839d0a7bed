//! Fetch-run configuration model, defaults and loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::title_candidates::TitleOverrides;

pub const CONFIG_FILE_NAME: &str = "fruitstand-images.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Root configuration read from `fruitstand-images.toml`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// SQLite database holding `countries` and `fruit_facts`.
    pub database_path: PathBuf,
    /// Directory that receives downloaded images and the manifest.
    pub output_dir: PathBuf,
    /// Prefix stored in `fruit_facts.fruit_image` in front of the file name.
    pub public_prefix: String,
    pub manifest_file_name: String,
    pub api_base_url: String,
    pub user_agent: String,
    pub accept_header: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Longest edge requested for the thumbnail fallback.
    pub thumbnail_size_px: u32,
    /// Downloads shorter than this are treated as placeholders.
    pub min_image_bytes: usize,
    pub jpeg_quality: u8,
    pub max_download_bytes: u64,
    pub candidate_pause_ms: u64,
    pub subject_pause_ms: u64,
    pub subject_limit: Option<u32>,
    /// Replaces the built-in title override table when present.
    pub title_overrides: Option<BTreeMap<String, Vec<String>>>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("db").join("fruit.db"),
            output_dir: PathBuf::from("static").join("images").join("spacefruit"),
            public_prefix: "static/images/spacefruit".to_string(),
            manifest_file_name: "_fruit_download_manifest.csv".to_string(),
            api_base_url: "https://en.wikipedia.org/w/api.php".to_string(),
            user_agent: concat!(
                "fruitstand-images/",
                env!("CARGO_PKG_VERSION"),
                " (fruit fact image fetcher)"
            )
            .to_string(),
            accept_header: "image/avif,image/webp,image/apng,image/*,*/*;q=0.8".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            thumbnail_size_px: 2000,
            min_image_bytes: 1024,
            jpeg_quality: 90,
            max_download_bytes: 64 * 1024 * 1024,
            candidate_pause_ms: 250,
            subject_pause_ms: 500,
            subject_limit: Some(50),
            title_overrides: None,
        }
    }
}

impl FetchConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest_file_name)
    }

    pub fn candidate_pause(&self) -> Duration {
        Duration::from_millis(self.candidate_pause_ms)
    }

    pub fn subject_pause(&self) -> Duration {
        Duration::from_millis(self.subject_pause_ms)
    }

    pub fn title_overrides(&self) -> TitleOverrides {
        match &self.title_overrides {
            Some(table) => TitleOverrides::from_config_table(table),
            None => TitleOverrides::default(),
        }
    }
}

/// Clamps values that would make the pipeline misbehave.
pub fn sanitize_config(mut config: FetchConfig) -> FetchConfig {
    config.jpeg_quality = config.jpeg_quality.clamp(1, 100);
    config.thumbnail_size_px = config.thumbnail_size_px.max(1);
    config.min_image_bytes = config.min_image_bytes.max(1);
    config.max_download_bytes = config.max_download_bytes.max(config.min_image_bytes as u64);
    config.connect_timeout_secs = config.connect_timeout_secs.max(1);
    config.read_timeout_secs = config.read_timeout_secs.max(1);
    config.public_prefix = config.public_prefix.trim_end_matches('/').to_string();
    if config.manifest_file_name.trim().is_empty() {
        config.manifest_file_name = FetchConfig::default().manifest_file_name;
    }
    config
}

pub fn parse_config(content: &str, path: &Path) -> Result<FetchConfig, ConfigError> {
    toml::from_str::<FetchConfig>(content)
        .map(sanitize_config)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn read_config_file(path: &Path) -> Result<FetchConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&content, path)?;
    info!("Loaded config. path={}", path.display());
    Ok(config)
}

/// An explicit path must exist. Otherwise the working directory and then the
/// user config directory are searched, falling back to defaults.
pub fn load_config(explicit_path: Option<&Path>) -> Result<FetchConfig, ConfigError> {
    if let Some(path) = explicit_path {
        return read_config_file(path);
    }

    let search_paths = [
        Some(PathBuf::from(CONFIG_FILE_NAME)),
        dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME)),
    ];
    for path in search_paths.into_iter().flatten() {
        if path.is_file() {
            return read_config_file(&path);
        }
    }

    info!("No config file found. Using defaults.");
    Ok(FetchConfig::default())
}
