//! Runtime settings shared by the core components.
//!
//! The server crate parses the TOML file and builds these values; only the
//! synchronizer settings are hot-reloaded, through a [`ConfigStore`].

mod config_store;
mod sync;

pub use config_store::ConfigStore;
pub use sync::SyncSettings;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bus routing and consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Exchange every [`ServiceUpdate`](touchline_sdk::objects::updates::ServiceUpdate) goes to.
    pub service_updates_exchange: String,
    pub service_updates_routing_key: String,
    pub service_updates_queue: String,
    /// Exchange the sports data provider pushes state notifications to.
    pub provider_exchange: String,
    pub provider_routing_key: String,
    pub provider_queue: String,
    /// Queue of this instance's streaming gateway, bound to the service
    /// updates exchange next to the processor queue.
    pub gateway_queue: String,
    pub prefetch: u16,
    /// Service updates older than this many seconds are dropped unprocessed.
    pub stale_update_limit_secs: u64,
    pub channel_pool_size: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            service_updates_exchange: "service_updates".into(),
            service_updates_routing_key: "messenger".into(),
            service_updates_queue: "messenger_service_updates".into(),
            provider_exchange: "sportlevel".into(),
            provider_routing_key: "match_state".into(),
            provider_queue: "messenger_match_state".into(),
            gateway_queue: "messenger_gateway_updates".into(),
            prefetch: 1,
            stale_update_limit_secs: 600,
            channel_pool_size: 8,
        }
    }
}

impl BusSettings {
    pub fn stale_update_limit(&self) -> Duration {
        Duration::from_secs(self.stale_update_limit_secs)
    }
}

/// In-memory cache bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    pub max_value_size: usize,
    pub matches_ttl_secs: u64,
    pub matches_max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            max_entries: 10_000,
            max_value_size: 64 * 1024,
            matches_ttl_secs: 6 * 60 * 60,
            matches_max_entries: 5_000,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn matches_ttl(&self) -> Duration {
        Duration::from_secs(self.matches_ttl_secs)
    }
}

/// Unread counter cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSettings {
    pub ttl_secs: u64,
    /// Capacity of the queue feeding the counter publisher task.
    pub queue_size: usize,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            queue_size: 1024,
        }
    }
}

impl CounterSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Streaming gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Lifetime of a user's presence key; client frames refresh it.
    pub presence_ttl_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            presence_ttl_secs: 90,
        }
    }
}

impl GatewaySettings {
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }
}
