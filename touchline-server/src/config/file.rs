//! TOML file configuration structures.
//!
//! These structs map directly to the `touchline.toml` file format. Every
//! section is optional; missing keys fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use touchline_core::config::{
    BusSettings, CacheSettings, CounterSettings, GatewaySettings, SyncSettings,
};
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub bus: BusSettings,
    pub sync: SyncSettings,
    pub provider: ProviderConfig,
    pub cache: CacheSettings,
    pub counters: CounterSettings,
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    pub listen: SocketAddr,
    pub database_max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            database_max_connections: 10,
        }
    }
}

/// Service token settings. The signing secret comes from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token audiences this server accepts.
    pub service_audiences: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_audiences: vec!["messenger".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090/".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    pub fn url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.base_url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
