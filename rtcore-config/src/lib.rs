//! Configuration management for the real-time core

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Lowest spectrum bin used by the delay estimator's binary spectrum
pub const BAND_FIRST: usize = 12;
/// Highest spectrum bin used by the delay estimator's binary spectrum
pub const BAND_LAST: usize = 43;

/// Environment variable prefix, e.g. `RTCORE__DELAY__HISTORY_SIZE=120`
pub const ENV_PREFIX: &str = "RTCORE";

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but are out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Delay estimator configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Bins per far/near spectrum
    pub spectrum_size: usize,
    /// Number of candidate lags, in blocks
    pub history_size: usize,
    /// Keep the far-end spectrum history for aligned read-back
    pub enable_alignment: bool,
    /// Capacity of the runtime far-end buffer, in blocks
    pub far_buffer_blocks: usize,
}

impl Default for DelayConfig {
    fn default() -> Self {
        DelayConfig {
            spectrum_size: 65,
            history_size: 100,
            enable_alignment: true,
            far_buffer_blocks: 50,
        }
    }
}

/// Depacketizer configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DepacketizerConfig {
    /// RTP payload type carrying H.265
    pub payload_type: u8,
    /// Tag written into every parsed frame
    pub codec_tag: String,
    /// Largest NAL unit rebuilt from FU fragments, in bytes
    pub max_nal_size: usize,
    /// Streams with an unfinished FU NAL unit tracked at once
    pub max_fu_streams: usize,
}

impl Default for DepacketizerConfig {
    fn default() -> Self {
        DepacketizerConfig {
            payload_type: 96,
            codec_tag: "H265".to_string(),
            max_nal_size: 4 * 1024 * 1024,
            max_fu_streams: 64,
        }
    }
}

/// Bitrate allocator configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Global min-bitrate enforcement flag
    pub enforce_min_bitrate: bool,
    /// Extra share of `min` a paused observer needs before it resumes
    pub toggle_hysteresis_fraction: f64,
    /// Lower bound of the resume hysteresis (bps)
    pub min_toggle_bitrate_bps: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            enforce_min_bitrate: true,
            toggle_hysteresis_fraction: 0.1,
            min_toggle_bitrate_bps: 20_000,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bounded input queue depth per pipeline
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            channel_capacity: 256,
        }
    }
}

/// Complete core configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub delay: DelayConfig,
    pub depacketizer: DepacketizerConfig,
    pub allocator: AllocatorConfig,
    pub runtime: RuntimeConfig,
    pub log_level: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            delay: DelayConfig::default(),
            depacketizer: DepacketizerConfig::default(),
            allocator: AllocatorConfig::default(),
            runtime: RuntimeConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load defaults, then `path` (if any), then `RTCORE__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CoreConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the subsystems cannot be constructed with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay.spectrum_size <= BAND_LAST {
            return Err(ConfigError::Invalid(format!(
                "delay.spectrum_size must exceed {}, got {}",
                BAND_LAST, self.delay.spectrum_size
            )));
        }
        if self.delay.history_size == 0 {
            return Err(ConfigError::Invalid(
                "delay.history_size must be positive".to_string(),
            ));
        }
        if self.delay.far_buffer_blocks == 0 {
            return Err(ConfigError::Invalid(
                "delay.far_buffer_blocks must be positive".to_string(),
            ));
        }
        if self.depacketizer.max_nal_size == 0 || self.depacketizer.max_fu_streams == 0 {
            return Err(ConfigError::Invalid(
                "depacketizer.max_nal_size and depacketizer.max_fu_streams must be positive"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.allocator.toggle_hysteresis_fraction) {
            return Err(ConfigError::Invalid(format!(
                "allocator.toggle_hysteresis_fraction out of [0, 1]: {}",
                self.allocator.toggle_hysteresis_fraction
            )));
        }
        if self.runtime.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "runtime.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}
