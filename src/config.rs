use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::export::config::{Codec, Format, Quality};
use crate::export::mapping::MappingRule;
use crate::features::index::MAX_FEATURES;
use crate::features::packer::DEFAULT_TIME_SAMPLES;

const CONFIG_FILE: &str = "stemlight.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub textures: TextureConfig,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub effect: EffectConfig,
    #[serde(default)]
    pub mapping: Vec<MappingRule>,
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub format: Option<Format>,
    #[serde(default)]
    pub codec: Option<Codec>,
    #[serde(default)]
    pub preset: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TextureConfig {
    #[serde(default = "default_time_samples")]
    pub time_samples: usize,
    #[serde(default = "default_max_features")]
    pub max_features: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExportSettings {
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_progress_stride")]
    pub progress_stride: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct EffectConfig {
    #[serde(default = "default_effect")]
    pub name: String,
    /// Used when the effect manifest does not set its own interval.
    #[serde(default = "default_param_refresh")]
    pub param_refresh_ms: u64,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            quality: None,
            format: None,
            codec: None,
            preset: None,
        }
    }
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            time_samples: default_time_samples(),
            max_features: default_max_features(),
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            progress_stride: default_progress_stride(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            name: default_effect(),
            param_refresh_ms: default_param_refresh(),
            params: HashMap::new(),
        }
    }
}

fn default_width() -> u32 { 1920 }
fn default_height() -> u32 { 1080 }
fn default_fps() -> u32 { 30 }
fn default_time_samples() -> usize { DEFAULT_TIME_SAMPLES }
fn default_max_features() -> usize { MAX_FEATURES }
fn default_grace_period() -> u64 { 60 }
fn default_progress_stride() -> usize { 10 }
fn default_output_dir() -> PathBuf { PathBuf::from("exports") }
fn default_effect() -> String { "feature_bars".into() }
fn default_param_refresh() -> u64 { 100 }

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(err) => {
            log::warn!("Invalid config {}: {}", path.display(), err);
            None
        }
    }
}

/// Explicit path, else `./stemlight.toml`, else the per-user config file.
pub fn discover_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("stemlight").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("stemlight").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    })
}
