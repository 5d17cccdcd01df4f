// Global configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::engine::core::{
    AudioCodecSetting, AudioMode, Codec, ContainerSetting, EncodingMode, QualityPreset,
    RateControlSetting, SubtitleMode, parse_bitrate,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("encoding_mode = \"gpu_only\" requires software_fallback_allowed to be set explicitly")]
    MissingFallbackPolicy,

    #[error("{field} = {value:?} is not a valid bitrate (expected e.g. \"2M\" or \"4000k\")")]
    InvalidBitrate { field: &'static str, value: String },

    #[error("min_savings_ratio must be in [0, 1), got {0}")]
    InvalidSavingsRatio(f64),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("audio_mode = \"by_language\" needs at least one entry in audio_languages")]
    NoAudioLanguages,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub encoding: EncodingConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub subtitles: SubtitleConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingConfig {
    /// auto, gpu_only or cpu_only
    #[serde(default)]
    pub encoding_mode: EncodingMode,

    /// Try VA-API before the vendor framework (QSV/AMF)
    #[serde(default)]
    pub prefer_secondary_backend: bool,

    #[serde(default = "default_target_codec")]
    pub target_codec: Codec,

    /// Encode to target_codec even when the source codec is more efficient
    #[serde(default)]
    pub force_target_codec: bool,

    #[serde(default, alias = "video_quality")]
    pub quality_preset: QualityPreset,

    /// auto follows the quality preset
    #[serde(default)]
    pub rate_control: RateControlSetting,

    #[serde(default)]
    pub container: ContainerSetting,

    #[serde(default = "default_video_bitrate", alias = "bitrate")]
    pub video_bitrate: String,

    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: String,

    /// Required when encoding_mode is gpu_only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_fallback_allowed: Option<bool>,

    /// Keep 10-bit sources at 10-bit when the encoder allows it
    #[serde(default = "default_true")]
    pub preserve_bit_depth: bool,

    /// Run black-bar detection before building the command
    #[serde(default)]
    pub auto_crop: bool,

    #[serde(default = "default_crop_min_dimension")]
    pub crop_min_dimension: u32,

    /// Older spelling of prefer_secondary_backend with the opposite sense
    #[serde(default, skip_serializing)]
    prefer_amf_over_vaapi: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub audio_codec: AudioCodecSetting,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    #[serde(default)]
    pub audio_mode: AudioMode,

    /// ISO 639-2 codes used by audio_mode = "by_language"
    #[serde(default = "default_audio_languages")]
    pub audio_languages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleConfig {
    #[serde(default)]
    pub subtitle_mode: SubtitleMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Skip files already at or below the expected bitrate for the target
    #[serde(default = "default_true")]
    pub skip_optimal: bool,

    /// Run a sample encode and skip when savings are too small
    #[serde(default)]
    pub size_prediction: bool,

    /// Plan only; size prediction is not run
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_test_duration")]
    pub test_duration_seconds: u32,

    #[serde(default = "default_min_savings_ratio")]
    pub min_savings_ratio: f64,

    #[serde(default = "default_min_file_size")]
    pub min_file_size_bytes: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    #[serde(default = "default_test_encode_timeout")]
    pub test_encode_timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_target_codec() -> Codec {
    Codec::Hevc
}

fn default_video_bitrate() -> String {
    "2M".to_string()
}

fn default_max_bitrate() -> String {
    "4M".to_string()
}

fn default_crop_min_dimension() -> u32 {
    128
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_audio_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_test_duration() -> u32 {
    60
}

fn default_min_savings_ratio() -> f64 {
    0.05
}

fn default_min_file_size() -> u64 {
    1024
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_test_encode_timeout() -> u64 {
    300
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            encoding_mode: EncodingMode::Auto,
            prefer_secondary_backend: false,
            target_codec: default_target_codec(),
            force_target_codec: false,
            quality_preset: QualityPreset::Balanced,
            rate_control: RateControlSetting::Auto,
            container: ContainerSetting::Mkv,
            video_bitrate: default_video_bitrate(),
            max_bitrate: default_max_bitrate(),
            software_fallback_allowed: Some(false), // written out so gpu_only users see it
            preserve_bit_depth: true,
            auto_crop: false,
            crop_min_dimension: default_crop_min_dimension(),
            prefer_amf_over_vaapi: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            audio_codec: AudioCodecSetting::Aac,
            audio_bitrate: default_audio_bitrate(),
            audio_mode: AudioMode::All,
            audio_languages: default_audio_languages(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            skip_optimal: true,
            size_prediction: false,
            dry_run: false,
            test_duration_seconds: default_test_duration(),
            min_savings_ratio: default_min_savings_ratio(),
            min_file_size_bytes: default_min_file_size(),
            probe_timeout_seconds: default_probe_timeout(),
            test_encode_timeout_seconds: default_test_encode_timeout(),
        }
    }
}

impl EncodingConfig {
    /// Fold older option spellings into their current fields
    pub fn apply_legacy_keys(&mut self) {
        if let Some(prefer_amf) = self.prefer_amf_over_vaapi.take() {
            warn!("prefer_amf_over_vaapi is deprecated, use prefer_secondary_backend");
            self.prefer_secondary_backend = !prefer_amf;
        }
    }

    pub fn video_bitrate_bps(&self) -> Result<u64, ConfigError> {
        parse_bitrate(&self.video_bitrate).ok_or_else(|| ConfigError::InvalidBitrate {
            field: "video_bitrate",
            value: self.video_bitrate.clone(),
        })
    }

    pub fn max_bitrate_bps(&self) -> Result<u64, ConfigError> {
        parse_bitrate(&self.max_bitrate).ok_or_else(|| ConfigError::InvalidBitrate {
            field: "max_bitrate",
            value: self.max_bitrate.clone(),
        })
    }

    /// Unset means "not allowed" outside gpu_only mode
    pub fn fallback_allowed(&self) -> bool {
        self.software_fallback_allowed.unwrap_or(false)
    }
}

impl AnalysisConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn test_encode_timeout(&self) -> Duration {
        Duration::from_secs(self.test_encode_timeout_seconds)
    }
}

impl Config {
    /// Reject settings the engine cannot act on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoding.encoding_mode == EncodingMode::GpuOnly
            && self.encoding.software_fallback_allowed.is_none()
        {
            return Err(ConfigError::MissingFallbackPolicy);
        }

        self.encoding.video_bitrate_bps()?;
        self.encoding.max_bitrate_bps()?;

        if self.audio.audio_codec == AudioCodecSetting::Aac
            && parse_bitrate(&self.audio.audio_bitrate).is_none()
        {
            return Err(ConfigError::InvalidBitrate {
                field: "audio_bitrate",
                value: self.audio.audio_bitrate.clone(),
            });
        }

        if self.audio.audio_mode == AudioMode::ByLanguage && self.audio.audio_languages.is_empty() {
            return Err(ConfigError::NoAudioLanguages);
        }

        let ratio = self.analysis.min_savings_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(ConfigError::InvalidSavingsRatio(ratio));
        }

        if self.analysis.test_duration_seconds == 0 {
            return Err(ConfigError::ZeroValue("test_duration_seconds"));
        }
        if self.analysis.probe_timeout_seconds == 0 {
            return Err(ConfigError::ZeroValue("probe_timeout_seconds"));
        }
        if self.analysis.test_encode_timeout_seconds == 0 {
            return Err(ConfigError::ZeroValue("test_encode_timeout_seconds"));
        }

        Ok(())
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("ffpolicy");
        Ok(config_dir.join("config.toml"))
    }

    /// Parse a config file at an explicit location
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.encoding.apply_legacy_keys();

        Ok(config)
    }

    /// Load config from disk, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();

            // A read-only config dir still leaves us with usable defaults
            if let Err(e) = config.save() {
                warn!(error = %e, "could not create default config file, using built-in defaults");
            }

            Ok(config)
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Check if config file exists
    pub fn exists() -> bool {
        Self::config_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Create a default config file if it doesn't exist
    pub fn ensure_default() -> Result<()> {
        if !Self::exists() {
            Config::default().save()?;
        }
        Ok(())
    }
}
