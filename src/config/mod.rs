//! Configuration loading.
//!
//! Sources, later overriding earlier:
//! 1. built-in defaults
//! 2. `config.yaml` in the current directory (if it exists)
//! 3. file given to [`Config::load`]
//! 4. file named by `SUREBET_CONFIG`
//! 5. `SUREBET__` prefixed environment variables (`SUREBET__NATS__URL`)
//! 6. legacy unprefixed variables (`NATS_URL`, `SERVICE_NAME`, ...)

mod broker;

pub use broker::{ConsumerConfig, NatsConfig, StreamConfig};

use serde::Deserialize;

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SUREBET_CONFIG";

/// Prefix for structured environment overrides.
pub const CONFIG_ENV_PREFIX: &str = "SUREBET";

/// Environment variable for the tracing filter directive.
pub const LOG_ENV_VAR: &str = "SUREBET_LOG";

/// Config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "config";

/// Legacy environment variables and the keys they override.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("NATS_URL", "nats.url"),
    ("NATS_USER", "nats.user"),
    ("NATS_PASSWORD", "nats.password"),
    ("CONSUMER_NAME", "consumer.name"),
    ("CONSUMER_GROUP", "consumer.group"),
    ("PULL_BATCH_SIZE", "consumer.pull_batch_size"),
    ("SERVICE_NAME", "service_name"),
    ("LOG_LEVEL", "log_level"),
    ("ENVIRONMENT", "environment"),
];

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nats: NatsConfig,
    pub stream: StreamConfig,
    pub consumer: ConsumerConfig,
    /// Stamped as `source` on every published envelope.
    pub service_name: String,
    pub log_level: String,
    /// `production` switches logs to JSON.
    pub environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            stream: StreamConfig::default(),
            consumer: ConsumerConfig::default(),
            service_name: "unknown-service".to_string(),
            log_level: "info".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in LEGACY_ENV {
            let value = std::env::var(var).ok().filter(|v| !v.is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::default()
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nats.url.is_empty() {
            return Err(ConfigError::Invalid("nats.url must not be empty".to_string()));
        }
        if self.stream.name.is_empty() || self.stream.subjects.is_empty() {
            return Err(ConfigError::Invalid(
                "stream.name and stream.subjects are required".to_string(),
            ));
        }
        if self.consumer.name.is_empty() {
            return Err(ConfigError::Invalid("consumer.name must not be empty".to_string()));
        }
        if self.consumer.pull_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "consumer.pull_batch_size must be positive".to_string(),
            ));
        }
        if self.consumer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.nats.tls_cert_file.is_some() != self.nats.tls_key_file.is_some() {
            return Err(ConfigError::Invalid(
                "nats.tls_cert_file and nats.tls_key_file must be set together".to_string(),
            ));
        }
        Ok(())
    }
}
