//! Message bus: durable at-least-once delivery over AMQP.
//!
//! - [`BusPublisher`] publishes JSON payloads immediately or after a delay.
//!   Delays use a companion `_delayed` exchange/queue whose messages expire
//!   into the real destination through dead-lettering.
//! - [`QueueListener`] consumes a durable queue with bounded prefetch and
//!   acks or rejects each delivery depending on how its handler finished.
//! - [`AmqpBroker`] is the `lapin` implementation of [`Broker`].

mod amqp;
mod listener;
#[cfg(test)]
pub(crate) mod memory;
mod publisher;

pub use amqp::{AmqpBroker, AmqpConnection};
pub use listener::{Disposition, HandleError, ListenerArgs, MessageHandler, QueueListener};
pub use publisher::BusPublisher;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use touchline_sdk::objects::updates::ServiceUpdate;

/// Exchange / routing-key pair a message is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusRoute {
    pub exchange: String,
    pub routing_key: String,
}

impl BusRoute {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Companion route whose queue dead-letters into `self`.
    pub fn delayed(&self) -> BusRoute {
        BusRoute {
            exchange: format!("{}_delayed", self.exchange),
            routing_key: format!("{}_delayed", self.routing_key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

/// Errors raised by the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker connection unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    #[error("consumer stream closed")]
    ConsumerClosed,
}

/// Broker operations needed by the publisher.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError>;

    /// Declare a durable queue, optionally dead-lettering into `dead_letter`.
    async fn declare_queue(&self, name: &str, dead_letter: Option<&BusRoute>)
    -> Result<(), BusError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError>;

    /// Publish a JSON payload. `expiration` becomes the per-message TTL.
    async fn publish(
        &self,
        route: &BusRoute,
        payload: &[u8],
        expiration: Option<Duration>,
    ) -> Result<(), BusError>;
}

/// Publishes service updates after the owning transaction commits.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_update(&self, update: &ServiceUpdate) -> Result<(), BusError>;

    /// Publish `update` so that consumers receive it no earlier than `delay`.
    async fn publish_delayed_update(
        &self,
        update: &ServiceUpdate,
        delay: Duration,
    ) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_route_names() {
        let route = BusRoute::new("service_updates", "messenger");
        let delayed = route.delayed();
        assert_eq!(delayed.exchange, "service_updates_delayed");
        assert_eq!(delayed.routing_key, "messenger_delayed");
    }
}
