//! Recognition session configuration
//!
//! Loaded from `<config_dir>/asr-stream/config.json`, then overridden from
//! `ASR_*` environment variables. Missing fields take their defaults; the
//! server fields are optional here and checked by [`AsrConfig::validate`]
//! when a session is activated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::streaming::SendTiming;

const CONFIG_DIR_NAME: &str = "asr-stream";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required fields are missing
    Incomplete(Vec<&'static str>),
    /// A field holds a value no session can run with
    Invalid(String),
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Incomplete(missing) => {
                write!(f, "Configuration incomplete, missing: {}", missing.join(", "))
            }
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Config parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// WebSocket endpoint, e.g. `wss://asr.example.com/asr`
    pub endpoint: Option<String>,

    /// Recognizer (language/domain) to use on the server
    pub asr_system: Option<String>,

    pub app_id: Option<String>,

    /// Shared secret for the session signature. Never logged.
    pub app_secret: Option<String>,

    /// Capture and upload sample rate in Hz
    pub sample_rate: u32,

    /// Deliver partial hypotheses while audio is streaming
    pub enable_partial_results: bool,

    /// Keep the session open across final results; finals arrive as
    /// semi-final partials and the capture buffer is truncated on each send
    pub unlimited_duration: bool,

    /// Ask the server to post-process spoken numbers into digits
    pub postprocess_numbers: bool,

    /// Normalize whitespace and capitalization of hypotheses
    pub pretty_print: bool,

    /// Free-form metadata forwarded in the auth frame
    pub custom_info: serde_json::Map<String, serde_json::Value>,

    /// Capture buffer capacity in seconds
    pub max_buffer_secs: u32,

    pub send_delay_ms: u64,
    pub send_interval_ms: u64,
    pub connect_timeout_ms: u64,

    /// Finish the session when the speaker pauses
    pub stop_on_pause: bool,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            asr_system: None,
            app_id: None,
            app_secret: None,
            sample_rate: 16000,
            enable_partial_results: false,
            unlimited_duration: false,
            postprocess_numbers: true,
            pretty_print: true,
            custom_info: serde_json::Map::new(),
            max_buffer_secs: 35,
            send_delay_ms: 10,
            send_interval_ms: 200,
            connect_timeout_ms: 10_000,
            stop_on_pause: false,
        }
    }
}

impl AsrConfig {
    /// Load from the default location with environment overrides applied
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<AsrConfig>(&contents)
                .map_err(|e| ConfigError::Parse(format!("{:?}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Config: {:?} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(format!("read {:?}: {}", path, e))),
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path()?)
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::Io(format!("create config directory {:?}: {}", parent, e))
            })?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("serialize config: {}", e)))?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .map_err(|e| ConfigError::Io(format!("write {:?}: {}", tmp_path, e)))?;

        // rename over an existing file fails on Windows
        if cfg!(windows) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(ConfigError::Io(format!("remove {:?}: {}", path, e)));
                }
            }
        }

        std::fs::rename(&tmp_path, path).map_err(|e| {
            ConfigError::Io(format!("rename {:?} to {:?}: {}", tmp_path, path, e))
        })?;

        log::info!("Config: saved to {:?}", path);
        Ok(())
    }

    /// Override fields from `ASR_*` variables looked up through `var`.
    /// Unparseable numeric or boolean values are ignored with a warning.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut Option<String>, key: &str| {
            if let Some(value) = var(key).filter(|v| !v.trim().is_empty()) {
                *target = Some(value.trim().to_string());
            }
        };
        set(&mut self.endpoint, "ASR_ENDPOINT");
        set(&mut self.asr_system, "ASR_SYSTEM");
        set(&mut self.app_id, "ASR_APP_ID");
        set(&mut self.app_secret, "ASR_APP_SECRET");

        if let Some(value) = var("ASR_SAMPLE_RATE") {
            match value.trim().parse::<u32>() {
                Ok(rate) if rate > 0 => self.sample_rate = rate,
                _ => log::warn!("Config: ignoring invalid ASR_SAMPLE_RATE {:?}", value),
            }
        }

        if let Some(value) = var("ASR_PARTIAL_RESULTS") {
            match parse_bool(&value) {
                Some(b) => self.enable_partial_results = b,
                None => log::warn!("Config: ignoring invalid ASR_PARTIAL_RESULTS {:?}", value),
            }
        }

        if let Some(value) = var("ASR_UNLIMITED_DURATION") {
            match parse_bool(&value) {
                Some(b) => self.unlimited_duration = b,
                None => {
                    log::warn!("Config: ignoring invalid ASR_UNLIMITED_DURATION {:?}", value)
                }
            }
        }
    }

    /// Names of required fields that are missing or blank
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let required = [
            ("endpoint", &self.endpoint),
            ("asr_system", &self.asr_system),
            ("app_id", &self.app_id),
            ("app_secret", &self.app_secret),
        ];

        required
            .into_iter()
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(name, _)| name)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(ConfigError::Incomplete(missing));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".to_string()));
        }
        Ok(())
    }

    /// Server post-processors to request in the auth frame
    pub fn postprocessors(&self) -> Vec<String> {
        if self.postprocess_numbers {
            vec!["numbers".to_string()]
        } else {
            Vec::new()
        }
    }

    pub(crate) fn send_timing(&self) -> SendTiming {
        SendTiming {
            initial_delay: Duration::from_millis(self.send_delay_ms),
            interval: Duration::from_millis(self.send_interval_ms.max(1)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// `<config_dir>/asr-stream/config.json`
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::Io("could not determine config directory".to_string()))?;
    Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
