use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use touchline_sdk::objects::updates::ServiceUpdate;
use tracing::{debug, info};

use super::{Broker, BusError, BusRoute, EventPublisher, ExchangeKind};

/// Publishes JSON payloads through a [`Broker`].
///
/// The first delayed publish to a given route declares the companion
/// `{exchange}_delayed` exchange and `{routing_key}_delayed` queue. The
/// queue dead-letters into the original route, so a message published
/// there with an expiration reappears at the real destination once it
/// expires. Each companion pair is declared at most once per publisher.
pub struct BusPublisher<B> {
    broker: Arc<B>,
    updates_route: BusRoute,
    provisioned: Mutex<HashSet<BusRoute>>,
}

impl<B: Broker> BusPublisher<B> {
    /// `updates_route` is where [`ServiceUpdate`]s are published.
    pub fn new(broker: Arc<B>, updates_route: BusRoute) -> Self {
        Self {
            broker,
            updates_route,
            provisioned: Mutex::new(HashSet::new()),
        }
    }

    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        route: &BusRoute,
        payload: &T,
    ) -> Result<(), BusError> {
        let body = serde_json::to_vec(payload)?;
        self.broker.publish(route, &body, None).await
    }

    pub async fn publish_json_delayed<T: Serialize + Sync>(
        &self,
        route: &BusRoute,
        payload: &T,
        delay: Duration,
    ) -> Result<(), BusError> {
        let body = serde_json::to_vec(payload)?;
        let delayed = self.ensure_delayed_route(route).await?;
        debug!(
            exchange = %delayed.exchange,
            routing_key = %delayed.routing_key,
            delay_ms = delay.as_millis() as u64,
            "Publishing delayed message"
        );
        self.broker.publish(&delayed, &body, Some(delay)).await
    }

    async fn ensure_delayed_route(&self, route: &BusRoute) -> Result<BusRoute, BusError> {
        let delayed = route.delayed();
        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(route) {
            return Ok(delayed);
        }

        self.broker
            .declare_exchange(&delayed.exchange, ExchangeKind::Direct)
            .await?;
        self.broker
            .declare_queue(&delayed.routing_key, Some(route))
            .await?;
        self.broker
            .bind_queue(&delayed.routing_key, &delayed.exchange, &delayed.routing_key)
            .await?;

        info!(
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            "Provisioned delayed delivery route"
        );
        provisioned.insert(route.clone());
        Ok(delayed)
    }
}

#[async_trait]
impl<B: Broker> EventPublisher for BusPublisher<B> {
    async fn publish_update(&self, update: &ServiceUpdate) -> Result<(), BusError> {
        self.publish_json(&self.updates_route, update).await
    }

    async fn publish_delayed_update(
        &self,
        update: &ServiceUpdate,
        delay: Duration,
    ) -> Result<(), BusError> {
        self.publish_json_delayed(&self.updates_route, update, delay)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use touchline_sdk::objects::updates::UpdateKind;
    use touchline_sdk::objects::ChatType;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Exchange(String),
        Queue(String, Option<BusRoute>),
        Bind(String, String, String),
        Publish(BusRoute, Option<Duration>),
    }

    #[derive(Default)]
    struct RecordingBroker {
        ops: StdMutex<Vec<Op>>,
    }

    impl RecordingBroker {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn declare_exchange(&self, name: &str, _kind: ExchangeKind) -> Result<(), BusError> {
            self.ops.lock().unwrap().push(Op::Exchange(name.into()));
            Ok(())
        }

        async fn declare_queue(
            &self,
            name: &str,
            dead_letter: Option<&BusRoute>,
        ) -> Result<(), BusError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Queue(name.into(), dead_letter.cloned()));
            Ok(())
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> Result<(), BusError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Bind(queue.into(), exchange.into(), routing_key.into()));
            Ok(())
        }

        async fn publish(
            &self,
            route: &BusRoute,
            _payload: &[u8],
            expiration: Option<Duration>,
        ) -> Result<(), BusError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Publish(route.clone(), expiration));
            Ok(())
        }
    }

    fn update() -> ServiceUpdate {
        ServiceUpdate::now(UpdateKind::ChatCreated {
            chat_id: 1,
            chat_type: ChatType::Personal,
            created_by_user_id: None,
            match_id: None,
        })
    }

    #[tokio::test]
    async fn test_delayed_route_is_provisioned_once() {
        let broker = Arc::new(RecordingBroker::default());
        let publisher = BusPublisher::new(broker.clone(), BusRoute::new("E", "K"));

        for _ in 0..3 {
            publisher
                .publish_delayed_update(&update(), Duration::from_secs(5))
                .await
                .unwrap();
        }

        let ops = broker.ops();
        let declares = ops
            .iter()
            .filter(|op| !matches!(op, Op::Publish(..)))
            .count();
        assert_eq!(declares, 3);
        assert_eq!(ops[0], Op::Exchange("E_delayed".into()));
        assert_eq!(
            ops[1],
            Op::Queue("K_delayed".into(), Some(BusRoute::new("E", "K")))
        );
        assert_eq!(
            ops[2],
            Op::Bind("K_delayed".into(), "E_delayed".into(), "K_delayed".into())
        );
        let publishes: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Publish(route, exp) => Some((route.clone(), *exp)),
                _ => None,
            })
            .collect();
        assert_eq!(publishes.len(), 3);
        assert!(publishes.iter().all(|(route, exp)| {
            *route == BusRoute::new("E_delayed", "K_delayed")
                && *exp == Some(Duration::from_secs(5))
        }));
    }

    #[tokio::test]
    async fn test_each_route_gets_its_own_companion() {
        let broker = Arc::new(RecordingBroker::default());
        let publisher = BusPublisher::new(broker.clone(), BusRoute::new("E", "K"));
        let other = BusRoute::new("E", "other");

        publisher
            .publish_json_delayed(&BusRoute::new("E", "K"), &1, Duration::from_secs(1))
            .await
            .unwrap();
        publisher
            .publish_json_delayed(&other, &1, Duration::from_secs(1))
            .await
            .unwrap();

        let queues: Vec<_> = broker
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Queue(name, _) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(queues, vec!["K_delayed".to_string(), "other_delayed".to_string()]);
    }

    #[tokio::test]
    async fn test_immediate_publish_has_no_expiration() {
        let broker = Arc::new(RecordingBroker::default());
        let publisher = BusPublisher::new(broker.clone(), BusRoute::new("E", "K"));
        publisher.publish_update(&update()).await.unwrap();
        assert_eq!(
            broker.ops(),
            vec![Op::Publish(BusRoute::new("E", "K"), None)]
        );
    }
}
