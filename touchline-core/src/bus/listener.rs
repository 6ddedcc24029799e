use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::amqp::{durable_exchange, durable_queue, lapin_exchange_kind};
use super::{AmqpConnection, BusError, ExchangeKind};

/// Outcome of a handler that did not succeed.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The message can never be processed; discard it.
    #[error("dropped: {0}")]
    Drop(String),
    /// Processing failed unexpectedly.
    #[error("failed: {0}")]
    Failed(String),
}

/// Consumer-side callback of a [`QueueListener`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + Send;

    async fn handle(&self, message: Self::Message) -> Result<(), HandleError>;
}

/// What happens to a delivery once its processing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Handled(Result<(), HandleError>),
    Undecodable,
    Cancelled,
}

impl Outcome {
    /// Only work interrupted by shutdown goes back to the queue; everything
    /// else that failed is rejected and left to dead-lettering.
    pub(crate) fn disposition(&self) -> Disposition {
        match self {
            Outcome::Handled(Ok(())) => Disposition::Ack,
            Outcome::Handled(Err(_)) | Outcome::Undecodable => {
                Disposition::Reject { requeue: false }
            }
            Outcome::Cancelled => Disposition::Reject { requeue: true },
        }
    }
}

/// Where and how a [`QueueListener`] consumes.
#[derive(Debug, Clone)]
pub struct ListenerArgs {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    /// Unacknowledged deliveries allowed in flight. `1` processes strictly
    /// one message at a time.
    pub prefetch: u16,
}

/// Consumes a durable queue and dispatches each message to a handler.
pub struct QueueListener<H> {
    connection: Arc<AmqpConnection>,
    args: ListenerArgs,
    handler: Arc<H>,
}

impl<H: MessageHandler> QueueListener<H> {
    pub fn new(connection: Arc<AmqpConnection>, args: ListenerArgs, handler: Arc<H>) -> Self {
        Self {
            connection,
            args,
            handler,
        }
    }

    /// Consume until shutdown.
    ///
    /// Returns an error when the channel or consumer fails so the caller
    /// can restart the listener.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), BusError> {
        let channel = self.connection.channel().await?;
        let mut consumer = match self.start_consumer(&channel).await {
            Ok(consumer) => consumer,
            Err(e) => {
                close_channel(&channel, "listener setup failed").await;
                return Err(e);
            }
        };

        info!(
            queue = %self.args.queue,
            exchange = %self.args.exchange,
            prefetch = self.args.prefetch,
            "Queue listener started"
        );

        let result = loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(queue = %self.args.queue, "Queue listener received shutdown signal");
                        break Ok(());
                    }
                }

                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            if let Err(e) = self.process(delivery, &mut shutdown_rx).await {
                                break Err(e);
                            }
                            // `process` may have consumed the change notification.
                            if *shutdown_rx.borrow() {
                                info!(queue = %self.args.queue, "Queue listener received shutdown signal");
                                break Ok(());
                            }
                        }
                        Some(Err(e)) => break Err(e.into()),
                        None => break Err(BusError::ConsumerClosed),
                    }
                }
            }
        };

        match &result {
            Ok(()) => {
                close_channel(&channel, "listener shutdown").await;
                info!(queue = %self.args.queue, "Queue listener shutdown complete");
            }
            Err(_) => close_channel(&channel, "listener failed").await,
        }
        result
    }

    /// Declare the topology and start consuming.
    async fn start_consumer(&self, channel: &Channel) -> Result<Consumer, BusError> {
        channel
            .exchange_declare(
                &self.args.exchange,
                lapin_exchange_kind(self.args.exchange_kind),
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(&self.args.queue, durable_queue(), FieldTable::default())
            .await?;
        channel
            .queue_bind(
                &self.args.queue,
                &self.args.exchange,
                &self.args.routing_key,
                Default::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(self.args.prefetch, BasicQosOptions::default())
            .await?;
        Ok(channel
            .basic_consume(
                &self.args.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?)
    }

    async fn process(
        &self,
        delivery: Delivery,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let outcome = match serde_json::from_slice::<H::Message>(&delivery.data) {
            Err(e) => {
                warn!(queue = %self.args.queue, error = %e, "Undecodable message");
                Outcome::Undecodable
            }
            Ok(message) => {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(shutdown_rx) => Outcome::Cancelled,
                    result = self.handler.handle(message) => Outcome::Handled(result),
                }
            }
        };

        match &outcome {
            Outcome::Handled(Err(HandleError::Drop(reason))) => {
                debug!(queue = %self.args.queue, %reason, "Message dropped by handler");
            }
            Outcome::Handled(Err(e @ HandleError::Failed(_))) => {
                error!(queue = %self.args.queue, error = %e, "Message handler failed");
            }
            Outcome::Cancelled => {
                info!(queue = %self.args.queue, "Handler cancelled, returning message to queue");
            }
            _ => {}
        }

        match outcome.disposition() {
            Disposition::Ack => delivery.ack(BasicAckOptions::default()).await?,
            Disposition::Reject { requeue } => {
                delivery.reject(BasicRejectOptions { requeue }).await?
            }
        }
        Ok(())
    }
}

async fn close_channel(channel: &Channel, reason: &str) {
    if !channel.status().connected() {
        return;
    }
    if let Err(e) = channel.close(200, reason).await {
        debug!(error = %e, reason, "Listener channel close failed");
    }
}

/// Resolve once `shutdown_rx` reports `true`; never resolves if the sender
/// is gone.
pub(crate) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_acked() {
        assert_eq!(Outcome::Handled(Ok(())).disposition(), Disposition::Ack);
    }

    #[test]
    fn test_failures_are_rejected_without_requeue() {
        let dropped = Outcome::Handled(Err(HandleError::Drop("stale".into())));
        let failed = Outcome::Handled(Err(HandleError::Failed("db down".into())));
        for outcome in [dropped, failed, Outcome::Undecodable] {
            assert_eq!(outcome.disposition(), Disposition::Reject { requeue: false });
        }
    }

    #[test]
    fn test_cancellation_is_requeued() {
        assert_eq!(
            Outcome::Cancelled.disposition(),
            Disposition::Reject { requeue: true }
        );
    }

    #[tokio::test]
    #[ignore = "needs an AMQP broker at AMQP_URL"]
    async fn test_failed_setup_leaves_connection_usable() {
        let uri = std::env::var("AMQP_URL").unwrap();
        let connection = Arc::new(AmqpConnection::new(uri, 2));
        let exchange = format!("touchline-test-{}", uuid::Uuid::new_v4());
        let channel = connection.channel().await.unwrap();
        channel
            .exchange_declare(
                &exchange,
                lapin::ExchangeKind::Fanout,
                lapin::options::ExchangeDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .unwrap();

        struct Noop;
        #[async_trait]
        impl MessageHandler for Noop {
            type Message = serde_json::Value;
            async fn handle(&self, _message: Self::Message) -> Result<(), HandleError> {
                Ok(())
            }
        }

        // Redeclaring the exchange with another kind fails the setup.
        let listener = QueueListener::new(
            connection.clone(),
            ListenerArgs {
                exchange: exchange.clone(),
                exchange_kind: ExchangeKind::Direct,
                queue: format!("{exchange}-queue"),
                routing_key: "key".into(),
                prefetch: 1,
            },
            Arc::new(Noop),
        );
        let (_tx, rx) = watch::channel(false);
        assert!(listener.run(rx).await.is_err());

        assert!(connection.health_check().await);
        let fresh = connection.channel().await.unwrap();
        assert!(fresh.status().connected());
        fresh.exchange_delete(&exchange, Default::default()).await.unwrap();
        connection.close().await;
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}
