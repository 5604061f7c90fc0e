//! Configuration loading, validation, and management for Turnwright.
//!
//! Loads configuration from `~/.turnwright/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use turnwright_core::ApprovalMode;

/// The root configuration structure.
///
/// Maps directly to `~/.turnwright/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model used for turns, summaries and loop checks
    #[serde(default = "default_model")]
    pub model: String,

    /// Tool confirmation policy
    #[serde(default)]
    pub approval_mode: ApprovalMode,

    /// Safety limit on model round-trips per user prompt
    #[serde(default = "default_max_turn_iterations")]
    pub max_turn_iterations: u32,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub model_limits: ModelLimitsConfig,
}

fn default_model() -> String {
    "gemini-2.5-pro".into()
}
fn default_max_turn_iterations() -> u32 {
    100
}
fn default_true() -> bool {
    true
}

/// Tool scheduler settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on tools executing at once. Unset = unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// Loop detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Identical consecutive tool calls before a loop is declared
    #[serde(default = "default_tool_call_threshold")]
    pub tool_call_threshold: u32,

    /// Tools whose consecutive use is tracked regardless of arguments
    #[serde(default = "default_monitored_tools")]
    pub monitored_tools: Vec<String>,

    #[serde(default = "default_monitored_tool_threshold")]
    pub monitored_tool_threshold: u32,

    /// Occurrences of one text window before spacing is examined
    #[serde(default = "default_content_loop_threshold")]
    pub content_loop_threshold: usize,

    /// Window size in characters
    #[serde(default = "default_content_chunk_size")]
    pub content_chunk_size: usize,

    /// Rolling buffer size in characters
    #[serde(default = "default_content_max_history")]
    pub content_max_history: usize,

    /// Allowed average spacing, as a multiple of the window size
    #[serde(default = "default_content_spacing_factor")]
    pub content_spacing_factor: f64,

    /// Turns within one prompt before the model is asked about loops
    #[serde(default = "default_llm_check_after_turns")]
    pub llm_check_after_turns: u32,

    /// Interval used until the first confidence is known
    #[serde(default = "default_llm_check_interval")]
    pub llm_check_interval: u32,

    #[serde(default = "default_llm_min_check_interval")]
    pub llm_min_check_interval: u32,

    #[serde(default = "default_llm_max_check_interval")]
    pub llm_max_check_interval: u32,

    #[serde(default = "default_llm_confidence_threshold")]
    pub llm_confidence_threshold: f64,

    /// Recent turns sent along with the loop check
    #[serde(default = "default_llm_history_turns")]
    pub llm_history_turns: usize,
}

fn default_tool_call_threshold() -> u32 {
    10
}
fn default_monitored_tools() -> Vec<String> {
    vec![
        "file_read".into(),
        "list_directory".into(),
        "search_files".into(),
    ]
}
fn default_monitored_tool_threshold() -> u32 {
    30
}
fn default_content_loop_threshold() -> usize {
    20
}
fn default_content_chunk_size() -> usize {
    50
}
fn default_content_max_history() -> usize {
    5000
}
fn default_content_spacing_factor() -> f64 {
    5.0
}
fn default_llm_check_after_turns() -> u32 {
    30
}
fn default_llm_check_interval() -> u32 {
    3
}
fn default_llm_min_check_interval() -> u32 {
    5
}
fn default_llm_max_check_interval() -> u32 {
    15
}
fn default_llm_confidence_threshold() -> f64 {
    0.9
}
fn default_llm_history_turns() -> usize {
    20
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_call_threshold: default_tool_call_threshold(),
            monitored_tools: default_monitored_tools(),
            monitored_tool_threshold: default_monitored_tool_threshold(),
            content_loop_threshold: default_content_loop_threshold(),
            content_chunk_size: default_content_chunk_size(),
            content_max_history: default_content_max_history(),
            content_spacing_factor: default_content_spacing_factor(),
            llm_check_after_turns: default_llm_check_after_turns(),
            llm_check_interval: default_llm_check_interval(),
            llm_min_check_interval: default_llm_min_check_interval(),
            llm_max_check_interval: default_llm_max_check_interval(),
            llm_confidence_threshold: default_llm_confidence_threshold(),
            llm_history_turns: default_llm_history_turns(),
        }
    }
}

/// History compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Fraction of the model's token limit that triggers compression
    #[serde(default = "default_compression_threshold")]
    pub threshold: f64,

    /// Fraction of the compressible history kept verbatim as the tail
    #[serde(default = "default_preserve_fraction")]
    pub preserve_fraction: f64,

    /// Leading environment/setup turns that are never compressed
    #[serde(default = "default_preserve_initial_turns")]
    pub preserve_initial_turns: usize,

    /// Fewer tail turns than this and compression is refused
    #[serde(default = "default_min_tail_turns")]
    pub min_tail_turns: usize,
}

fn default_compression_threshold() -> f64 {
    0.7
}
fn default_preserve_fraction() -> f64 {
    0.3
}
fn default_preserve_initial_turns() -> usize {
    2
}
fn default_min_tail_turns() -> usize {
    2
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: default_compression_threshold(),
            preserve_fraction: default_preserve_fraction(),
            preserve_initial_turns: default_preserve_initial_turns(),
            min_tail_turns: default_min_tail_turns(),
        }
    }
}

/// Context window sizes per model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimitsConfig {
    #[serde(default = "default_token_limit")]
    pub default_token_limit: u64,

    /// Model name (or name prefix) → token limit
    #[serde(default)]
    pub overrides: HashMap<String, u64>,
}

fn default_token_limit() -> u64 {
    1_048_576
}

impl Default for ModelLimitsConfig {
    fn default() -> Self {
        Self {
            default_token_limit: default_token_limit(),
            overrides: HashMap::new(),
        }
    }
}

impl ModelLimitsConfig {
    /// Token limit for `model`: exact match, then longest prefix, then default.
    pub fn token_limit(&self, model: &str) -> u64 {
        if let Some(limit) = self.overrides.get(model) {
            return *limit;
        }
        self.overrides
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, limit)| *limit)
            .unwrap_or(self.default_token_limit)
    }
}

impl EngineConfig {
    /// Load configuration from the default path (~/.turnwright/config.toml).
    ///
    /// Environment overrides:
    /// - `TURNWRIGHT_MODEL`
    /// - `TURNWRIGHT_APPROVAL_MODE` (`default`, `auto_edit`, `yolo`)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(model) = std::env::var("TURNWRIGHT_MODEL") {
            config.model = model;
        }

        if let Ok(mode) = std::env::var("TURNWRIGHT_APPROVAL_MODE") {
            config.approval_mode = mode
                .parse()
                .map_err(|e: String| ConfigError::ValidationError(e))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".turnwright")
    }

    /// Token limit of the configured model.
    pub fn token_limit(&self) -> u64 {
        self.model_limits.token_limit(&self.model)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.compression;
        if !(c.threshold > 0.0 && c.threshold <= 1.0) {
            return Err(ConfigError::ValidationError(
                "compression.threshold must be in (0.0, 1.0]".into(),
            ));
        }
        if !(c.preserve_fraction > 0.0 && c.preserve_fraction < 1.0) {
            return Err(ConfigError::ValidationError(
                "compression.preserve_fraction must be in (0.0, 1.0)".into(),
            ));
        }

        let l = &self.loop_detection;
        if l.tool_call_threshold == 0 || l.monitored_tool_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "loop_detection tool thresholds must be > 0".into(),
            ));
        }
        if l.content_chunk_size == 0 || l.content_loop_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "loop_detection.content_chunk_size must be > 0 and content_loop_threshold >= 2"
                    .into(),
            ));
        }
        if l.content_max_history < l.content_chunk_size {
            return Err(ConfigError::ValidationError(
                "loop_detection.content_max_history must be >= content_chunk_size".into(),
            ));
        }
        if l.llm_min_check_interval == 0 || l.llm_min_check_interval > l.llm_max_check_interval {
            return Err(ConfigError::ValidationError(
                "loop_detection: need 0 < llm_min_check_interval <= llm_max_check_interval".into(),
            ));
        }
        if !(0.0..=1.0).contains(&l.llm_confidence_threshold) {
            return Err(ConfigError::ValidationError(
                "loop_detection.llm_confidence_threshold must be in [0.0, 1.0]".into(),
            ));
        }

        if self.model_limits.default_token_limit == 0 {
            return Err(ConfigError::ValidationError(
                "model_limits.default_token_limit must be > 0".into(),
            ));
        }

        if self.scheduler.max_concurrency == Some(0) {
            return Err(ConfigError::ValidationError(
                "scheduler.max_concurrency must be > 0 when set".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            approval_mode: ApprovalMode::default(),
            max_turn_iterations: default_max_turn_iterations(),
            scheduler: SchedulerConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            compression: CompressionConfig::default(),
            model_limits: ModelLimitsConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
