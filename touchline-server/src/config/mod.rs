//! Configuration loading for touchline-server.
//!
//! Settings come from a TOML file plus CLI overrides; connection strings
//! and the token secret come from the environment.

pub mod file;

use crate::config::file::FileConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),
}

/// Reads the config file, applying CLI overrides on every load.
pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn load(&self) -> Result<FileConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.parse(&config_content)
    }

    fn parse(&self, content: &str) -> Result<FileConfig, ConfigError> {
        let mut config: FileConfig = toml::from_str(content)?;
        if let Some(listen) = self.listen_override {
            config.server.listen = listen;
        }
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.auth.service_audiences.is_empty() {
        return Err(ConfigError::ValidationError(
            "auth.service_audiences must not be empty".into(),
        ));
    }
    config.provider.url().map_err(|e| {
        ConfigError::ValidationError(format!("provider.base_url is invalid: {e}"))
    })?;
    if let Some(state) = config
        .sync
        .active_states
        .iter()
        .find(|state| !config.sync.state_codes.values().any(|s| s == *state))
    {
        return Err(ConfigError::ValidationError(format!(
            "active state {state:?} has no provider state code"
        )));
    }
    // Delayed state events keep their publish time; a grace window as long
    // as the stale limit would drop every one of them on arrival.
    if config.sync.inactive_grace >= config.bus.stale_update_limit() {
        return Err(ConfigError::ValidationError(format!(
            "sync.inactive_grace_secs ({}) must be shorter than bus.stale_update_limit_secs ({})",
            config.sync.inactive_grace.as_secs(),
            config.bus.stale_update_limit_secs
        )));
    }
    if config.bus.prefetch == 0 {
        return Err(ConfigError::ValidationError("bus.prefetch must be positive".into()));
    }
    Ok(())
}

/// Connection strings and secrets read from the environment.
pub struct Secrets {
    pub database_url: String,
    pub redis_url: String,
    pub amqp_url: String,
    pub jwt_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env("DATABASE_URL")?,
            redis_url: env("REDIS_URL")?,
            amqp_url: env("AMQP_URL")?,
            jwt_secret: env("TOUCHLINE_JWT_SECRET")?,
        })
    }
}

fn env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(listen: Option<SocketAddr>) -> ConfigLoader {
        ConfigLoader::new("touchline.toml", listen)
    }

    #[test]
    fn test_listen_override() {
        let listen: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let config = loader(Some(listen)).parse("[server]\nlisten = \"0.0.0.0:1\"").unwrap();
        assert_eq!(config.server.listen, listen);
    }

    #[test]
    fn test_active_state_without_code_is_rejected() {
        let err = loader(None)
            .parse("[sync]\nactive_states = [\"ARCHIVED\"]")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_grace_not_shorter_than_stale_limit_is_rejected() {
        let err = loader(None)
            .parse("[sync]\ninactive_grace_secs = 600\n[bus]\nstale_update_limit_secs = 600")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let config = loader(None)
            .parse("[sync]\ninactive_grace_secs = 599\n[bus]\nstale_update_limit_secs = 600")
            .unwrap();
        assert!(config.sync.inactive_grace < config.bus.stale_update_limit());
    }

    #[test]
    fn test_empty_audiences_are_rejected() {
        let err = loader(None)
            .parse("[auth]\nservice_audiences = []")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
