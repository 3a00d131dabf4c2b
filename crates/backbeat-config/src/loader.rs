//! Configuration loader with layered sources.

use crate::{AppConfig, ConfigValidator};
use backbeat_core::BackbeatError;
use config::{Config, ConfigError, Environment, File};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable prefix for overrides, e.g. `BACKBEAT_JOBS__LEASE__DURATION_SECS`.
pub const ENV_PREFIX: &str = "BACKBEAT";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `BACKBEAT_` prefix
    ///
    /// The merged result is validated before it is returned.
    pub fn new(config_dir: impl Into<String>) -> Result<Self, BackbeatError> {
        Self::with_env_prefix(config_dir, ENV_PREFIX)
    }

    /// Creates a loader reading overrides from a custom environment prefix.
    pub fn with_env_prefix(
        config_dir: impl Into<String>,
        env_prefix: impl Into<String>,
    ) -> Result<Self, BackbeatError> {
        let config_dir = config_dir.into();
        let env_prefix = env_prefix.into();
        let config = Self::load_config(&config_dir, &env_prefix)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
            env_prefix,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, BackbeatError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration stays active if the new one fails to load
    /// or validate.
    pub async fn reload(&self) -> Result<(), BackbeatError> {
        let new_config = Self::load_config(&self.config_dir, &self.env_prefix)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str, env_prefix: &str) -> Result<AppConfig, BackbeatError> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(format!("{env_prefix}_ENVIRONMENT"))
            .unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder()
            .set_default("app.environment", environment.clone())
            .map_err(config_error_to_backbeat_error)?;

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{config_dir}/{name}.toml");
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("jobs.worker.job_types")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_backbeat_error)?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_backbeat_error)?;

        ConfigValidator::validate(&app_config).map_err(|errors| {
            BackbeatError::Configuration(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        Ok(app_config)
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_backbeat_error(err: ConfigError) -> BackbeatError {
    BackbeatError::Configuration(err.to_string())
}
