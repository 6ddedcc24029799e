//! Application state shared across all request handlers.

use std::sync::Arc;
use tokio::sync::watch;
use touchline_core::bus::AmqpConnection;
use touchline_core::controllers::Messenger;
use touchline_core::streaming::Gateway;

use crate::api::extractors::TokenVerifier;

/// Cheap to clone; everything inside is behind an `Arc` or a pool handle.
#[derive(Clone)]
pub struct AppState {
    pub messenger: Messenger,
    pub gateway: Arc<Gateway>,
    pub tokens: Arc<TokenVerifier>,
    pub bus: Arc<AmqpConnection>,
    /// Flips to `true` once shutdown starts; WebSocket loops watch it.
    pub shutdown_rx: watch::Receiver<bool>,
}
