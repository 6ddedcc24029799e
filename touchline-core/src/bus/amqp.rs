//! `lapin` connection holder and [`Broker`] implementation.

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Broker, BusError, BusRoute, ExchangeKind};

const CONNECT_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(200);
const PERSISTENT: u8 = 2;

/// Shared AMQP connection with a small channel pool.
///
/// A dropped broker connection is re-established lazily by the next
/// caller, independently of the request that noticed the failure.
pub struct AmqpConnection {
    uri: String,
    connection: Mutex<Option<Arc<Connection>>>,
    channels: Mutex<Vec<Channel>>,
    pool_size: usize,
}

impl AmqpConnection {
    pub fn new(uri: impl Into<String>, pool_size: usize) -> Self {
        Self {
            uri: uri.into(),
            connection: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            pool_size,
        }
    }

    /// Open the connection eagerly so configuration errors surface at startup.
    pub async fn start(&self) -> Result<(), BusError> {
        self.connection().await.map(|_| ())
    }

    pub async fn health_check(&self) -> bool {
        let guard = self.connection.lock().await;
        guard.as_ref().is_some_and(|c| c.status().connected())
    }

    pub async fn close(&self) {
        self.channels.lock().await.clear();
        if let Some(conn) = self.connection.lock().await.take() {
            if let Err(e) = conn.close(200, "shutdown").await {
                debug!(error = %e, "AMQP connection close failed");
            }
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, BusError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(Arc::clone(conn));
            }
            warn!("AMQP connection lost, reconnecting");
            self.channels.lock().await.clear();
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Connection::connect(&self.uri, ConnectionProperties::default()).await {
                Ok(conn) => {
                    info!(attempt, "AMQP connection established");
                    let conn = Arc::new(conn);
                    *guard = Some(Arc::clone(&conn));
                    return Ok(conn);
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    let jitter = rand::rng().random_range(0..100);
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1)
                        + Duration::from_millis(jitter);
                    warn!(attempt, error = %e, ?backoff, "AMQP connect failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "AMQP connect failed, giving up");
                    return Err(BusError::Unavailable { attempts: attempt });
                }
            }
        }
    }

    /// Take a channel from the pool, or open a new one.
    pub async fn channel(&self) -> Result<Channel, BusError> {
        {
            let mut pool = self.channels.lock().await;
            while let Some(channel) = pool.pop() {
                if channel.status().connected() {
                    return Ok(channel);
                }
            }
        }
        let conn = self.connection().await?;
        Ok(conn.create_channel().await?)
    }

    /// Return a channel to the pool.
    pub async fn release(&self, channel: Channel) {
        if !channel.status().connected() {
            return;
        }
        let mut pool = self.channels.lock().await;
        if pool.len() < self.pool_size {
            pool.push(channel);
        }
    }
}

/// [`Broker`] backed by an [`AmqpConnection`].
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<AmqpConnection>,
}

impl AmqpBroker {
    pub fn new(connection: Arc<AmqpConnection>) -> Self {
        Self { connection }
    }
}

pub(crate) fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

pub(crate) fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

pub(crate) fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn dead_letter_arguments(target: &BusRoute) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(target.exchange.clone())),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(target.routing_key.clone())),
    );
    args
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError> {
        let channel = self.connection.channel().await?;
        channel
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        self.connection.release(channel).await;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&BusRoute>,
    ) -> Result<(), BusError> {
        let channel = self.connection.channel().await?;
        let args = dead_letter.map(dead_letter_arguments).unwrap_or_default();
        channel.queue_declare(name, durable_queue(), args).await?;
        self.connection.release(channel).await;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        let channel = self.connection.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.connection.release(channel).await;
        Ok(())
    }

    async fn publish(
        &self,
        route: &BusRoute,
        payload: &[u8],
        expiration: Option<Duration>,
    ) -> Result<(), BusError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT);
        if let Some(expiration) = expiration {
            properties =
                properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }

        let channel = self.connection.channel().await?;
        channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        self.connection.release(channel).await;
        Ok(())
    }
}
