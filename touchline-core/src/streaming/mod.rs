//! Streaming gateway internals.
//!
//! The HTTP layer upgrades and authenticates sockets; everything after
//! that lives here:
//!
//! - [`ConnectionRegistry`] maps connection ids to the users reachable
//!   through them and holds each connection's outbound queue.
//! - [`SubscriptionManager`] keeps one counters subscription per user,
//!   shared by all of that user's connections.
//! - [`Gateway`] ties both to presence for connect / disconnect.
//! - [`GatewayFanout`] turns bus events into socket updates.

mod fanout;
mod registry;
mod session;
mod subscriptions;

pub use fanout::{Audience, GatewayFanout, socket_update};
pub use registry::{
    CONNECTION_BUFFER, ConnectionId, ConnectionInfo, ConnectionRegistry, Outbound,
};
pub use session::Gateway;
pub use subscriptions::{RedisSubscriber, SubscriptionManager, UpdateSubscriber, decode_counters};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
