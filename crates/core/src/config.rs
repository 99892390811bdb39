use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SKETCHSPLIT_DATA_DIR";
const ENV_API_TOKEN: &str = "REPLICATE_API_TOKEN";
const ENV_MODEL_ID: &str = "MODEL_ID";
const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Prompt used when the client sends a prompt field that is blank.
pub const FALLBACK_PROMPT: &str = "a beautiful sketch";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub edges: EdgesConfig,
    pub stylize: StylizeConfig,
    pub compose: ComposeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    pub public_mount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_size_mb: u64,
    pub allowed_content_types: Vec<String>,
    pub default_prompt: String,
    /// Per-client `POST /stylize` budget per minute; `0` disables the limit.
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EdgesConfig {
    pub blur_sigma: f32,
    pub low_threshold: f32,
    pub high_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StylizeConfig {
    pub api_base: String,
    pub model: String,
    pub version: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComposeConfig {
    pub preview_frame_ms: u32,
    pub line_color: [u8; 3],
    pub background_value: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "https://sketchsplit.vercel.app".to_string(),
            ],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("temp_images"),
            public_mount: "temp_images".to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 10,
            allowed_content_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/heic".to_string(),
            ],
            default_prompt: "pencil sketch".to_string(),
            rate_limit_per_minute: 60,
        }
    }
}

impl Default for EdgesConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 1.1,
            low_threshold: 100.0,
            high_threshold: 200.0,
        }
    }
}

impl Default for StylizeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.replicate.com/v1".to_string(),
            model: "jagilley/controlnet-canny".to_string(),
            version: None,
            api_token: None,
            request_timeout_secs: 300,
            poll_interval_ms: 1000,
            download_timeout_secs: 60,
        }
    }
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            preview_frame_ms: 400,
            line_color: [0, 0, 0],
            background_value: 255,
        }
    }
}

impl UploadConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(BYTES_PER_MIB)
    }

    pub fn is_allowed_content_type(&self, content_type: &str) -> bool {
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
    }

    /// Missing prompt → configured default; blank prompt → [`FALLBACK_PROMPT`].
    pub fn resolve_prompt(&self, prompt: Option<&str>) -> String {
        match prompt {
            None => self.default_prompt.clone(),
            Some(raw) if raw.trim().is_empty() => FALLBACK_PROMPT.to_string(),
            Some(raw) => raw.trim().to_string(),
        }
    }
}

impl StylizeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// `REPLICATE_API_TOKEN` and `MODEL_ID` from the environment override file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env::var(ENV_API_TOKEN).ok().filter(|t| !t.trim().is_empty()) {
            self.api_token = Some(token);
        }
        if let Some(model) = env::var(ENV_MODEL_ID).ok().filter(|m| !m.trim().is_empty()) {
            self.model = model;
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SKETCHSPLIT_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml only if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
