use kinface_core::provider::default_model_dir;
use kinface_core::{FeatureWeights, JitterMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: optional TOML file, then `KINFACE_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory containing the ONNX model pack.
    pub model_dir: PathBuf,
    /// Model pack name, reported as `model_version` in responses.
    pub model_name: String,
    /// Largest accepted decoded image, in bytes.
    pub max_image_size: usize,
    /// Largest accepted `/batch-analysis` request, in images.
    pub max_batch_size: usize,
    pub api_key_enabled: bool,
    pub api_key: Option<String>,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    pub jitter: JitterMode,
    pub feature_weights: FeatureWeights,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_dir: default_model_dir(),
            model_name: "buffalo_l".to_string(),
            max_image_size: 10 * 1024 * 1024,
            max_batch_size: 10,
            api_key_enabled: false,
            api_key: None,
            intra_threads: 2,
            jitter: JitterMode::default(),
            feature_weights: FeatureWeights::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `KINFACE_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("KINFACE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        self.host = env_string("KINFACE_HOST").unwrap_or(std::mem::take(&mut self.host));
        self.port = env_parse("KINFACE_PORT", self.port);
        if let Some(dir) = env_string("KINFACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        self.model_name = env_string("KINFACE_MODEL_NAME").unwrap_or(std::mem::take(&mut self.model_name));
        self.max_image_size = env_parse("KINFACE_MAX_IMAGE_SIZE", self.max_image_size);
        self.max_batch_size = env_parse("KINFACE_MAX_BATCH_SIZE", self.max_batch_size);
        self.api_key_enabled = env_bool("KINFACE_API_KEY_ENABLED", self.api_key_enabled);
        if let Some(key) = env_string("KINFACE_API_KEY") {
            self.api_key = Some(key);
        }
        self.intra_threads = env_parse("KINFACE_INTRA_THREADS", self.intra_threads);
        match env_string("KINFACE_JITTER").as_deref() {
            Some("seeded") => self.jitter = JitterMode::Seeded,
            Some("random") => self.jitter = JitterMode::Random,
            Some(other) => tracing::warn!(value = other, "ignoring unknown KINFACE_JITTER"),
            None => {}
        }
        self.log_level = env_string("KINFACE_LOG_LEVEL").unwrap_or(std::mem::take(&mut self.log_level));
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feature_weights
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.api_key_enabled && self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid(
                "api_key_enabled is set but no api_key is configured".to_string(),
            ));
        }
        if self.max_batch_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "max_batch_size must be at least 2, got {}",
                self.max_batch_size
            )));
        }
        if self.intra_threads == 0 {
            return Err(ConfigError::Invalid("intra_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Requests larger than this are rejected before reading the body.
    pub fn max_request_size(&self) -> usize {
        self.max_image_size.saturating_mul(2)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Value of `key`, with unset and empty treated alike.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}
