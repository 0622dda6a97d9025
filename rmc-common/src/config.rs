//! Configuration loading and config file resolution
//!
//! The coordinator reads one TOML file at startup into [`RmcConfig`]. The
//! struct is built once and passed explicitly to everything that needs it;
//! there is no process-wide settings cache.
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`RMC_CONFIG`)
//! 3. User config directory (`<config_dir>/rmc/config.toml`)
//! 4. Compiled defaults (no file)
//!
//! A missing file is not an error: the service starts with defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "RMC_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmcConfig {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub sweep: SweepConfig,
    pub processing: ProcessingConfig,
    pub playback: PlaybackConfig,
    pub rta: RtaConfig,
    pub logging: LoggingConfig,
}

/// Local HTTP listener (webhook + control API)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Base URL the device uses to reach our webhook
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 5555,
            public_url: "http://127.0.0.1:5555".to_string(),
        }
    }
}

impl ServerConfig {
    /// Full callback URL handed to the device
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.public_url.trim_end_matches('/'))
    }
}

/// Measurement device HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Register the webhook with the device when the service starts
    pub subscribe_on_startup: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4735".to_string(),
            request_timeout_ms: 10_000,
            subscribe_on_startup: true,
        }
    }
}

impl DeviceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Measurement sweep timing and policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Poll interval while waiting for the device
    pub poll_tick_ms: u64,
    /// Ticks before an un-signaled operation resolves to TIMEOUT
    pub timeout_ticks: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub skip_delay_ms: u64,
    pub advance_delay_ms: u64,
    /// Suspend for a user decision on CAUTION/RETAKE ratings
    pub pause_on_quality_issue: bool,
    /// Show the reposition prompt before position 0 as well
    pub prompt_first_position: bool,
    /// Number of cancel requests sent on abort
    pub cancel_repeats: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            poll_tick_ms: 200,
            timeout_ticks: 1500,
            max_retries: 3,
            retry_delay_ms: 2000,
            skip_delay_ms: 1000,
            advance_delay_ms: 500,
            pause_on_quality_issue: false,
            prompt_first_position: true,
            cancel_repeats: 2,
        }
    }
}

impl SweepConfig {
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn skip_delay(&self) -> Duration {
        Duration::from_millis(self.skip_delay_ms)
    }

    pub fn advance_delay(&self) -> Duration {
        Duration::from_millis(self.advance_delay_ms)
    }

    /// Wall-clock ceiling for one device operation
    pub fn operation_ceiling(&self) -> Duration {
        self.poll_tick() * self.timeout_ticks
    }
}

/// Batch processing (alignment / averaging)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_retries: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

/// Which playback implementation plays sweep stimuli
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackBackend {
    /// External player process
    Process,
    /// In-process decode and audio output
    Library,
    /// No audio; playback completes immediately
    None,
}

/// Media playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub backend: PlaybackBackend,
    /// Player executable for the process backend (defaults to `vlc` on PATH)
    pub player_path: Option<PathBuf>,
    pub show_gui: bool,
    /// Directory holding per-channel sweep stimulus files
    pub stimulus_dir: Option<PathBuf>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            backend: PlaybackBackend::Process,
            player_path: None,
            show_gui: false,
            stimulus_dir: None,
        }
    }
}

/// RTA verification window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtaConfig {
    pub duration_secs: u64,
    pub min_samples: usize,
    /// Delay between playback-finished and finalization
    pub settle_ms: u64,
    /// Added to the duration to form the hard ceiling
    pub grace_secs: u64,
}

impl Default for RtaConfig {
    fn default() -> Self {
        Self {
            duration_secs: 8,
            min_samples: 20,
            settle_ms: 1000,
            grace_secs: 5,
        }
    }
}

impl RtaConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RmcConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RmcConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve and load configuration, falling back to defaults
    ///
    /// An explicitly named file (CLI or environment) that fails to load is an
    /// error; a missing user config file is not.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path, CONFIG_ENV_VAR) {
            ConfigSource::Explicit(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)
            }
            ConfigSource::UserDir(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)
            }
            ConfigSource::Defaults => {
                warn!("No configuration file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sweep.poll_tick_ms == 0 {
            return Err(Error::Config("sweep.poll_tick_ms must be > 0".to_string()));
        }
        if self.sweep.timeout_ticks == 0 {
            return Err(Error::Config("sweep.timeout_ticks must be > 0".to_string()));
        }
        if self.rta.min_samples == 0 {
            return Err(Error::Config("rta.min_samples must be > 0".to_string()));
        }
        if !self.device.base_url.starts_with("http://")
            && !self.device.base_url.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "device.base_url must be an http(s) URL: {}",
                self.device.base_url
            )));
        }
        Ok(())
    }
}

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Named on the command line or in the environment
    Explicit(PathBuf),
    /// Found in the user config directory
    UserDir(PathBuf),
    /// Nothing found
    Defaults,
}

/// Resolve the config file location following the priority order above
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> ConfigSource {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return ConfigSource::Explicit(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return ConfigSource::Explicit(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    if let Some(path) = user_config_file() {
        if path.exists() {
            return ConfigSource::UserDir(path);
        }
    }

    // Priority 4: Compiled defaults
    ConfigSource::Defaults
}

/// `<config_dir>/rmc/config.toml` for the current platform
pub fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rmc").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RmcConfig::default();
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.sweep.poll_tick_ms, 200);
        assert_eq!(config.sweep.timeout_ticks, 1500);
        assert_eq!(config.sweep.max_retries, 3);
        assert_eq!(config.processing.max_retries, 2);
        assert_eq!(config.rta.min_samples, 20);
        assert_eq!(config.playback.backend, PlaybackBackend::Process);
    }

    #[test]
    fn test_operation_ceiling_is_five_minutes() {
        let sweep = SweepConfig::default();
        assert_eq!(sweep.operation_ceiling(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RmcConfig::from_toml_str(
            r#"
            [sweep]
            pause_on_quality_issue = true

            [playback]
            backend = "none"
            "#,
        )
        .unwrap();

        assert!(config.sweep.pause_on_quality_issue);
        assert_eq!(config.sweep.max_retries, 3);
        assert_eq!(config.playback.backend, PlaybackBackend::None);
        assert_eq!(config.device.base_url, "http://127.0.0.1:4735");
    }

    #[test]
    fn test_zero_tick_rejected() {
        let result = RmcConfig::from_toml_str("[sweep]\npoll_tick_ms = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_device_url_rejected() {
        let result = RmcConfig::from_toml_str("[device]\nbase_url = \"localhost:4735\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_webhook_url_trims_trailing_slash() {
        let server = ServerConfig {
            public_url: "http://10.0.0.2:5555/".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(server.webhook_url(), "http://10.0.0.2:5555/webhook");
    }
}
