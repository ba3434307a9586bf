//! BrokerDeadLetterSink - publishes dead letters to a dedicated exchange.
//!
//! Routing key is `<stage>.dead`, so operators can bind one queue per stage or a
//! single catch-all queue per stage key.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{DeadLetter, StageId};
use crate::ports::{Broker, BrokerError, DeadLetterSink, PublishOptions};

pub struct BrokerDeadLetterSink {
    broker: Arc<dyn Broker>,
    exchange: String,
}

impl BrokerDeadLetterSink {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
        }
    }

    pub fn routing_key(stage: &StageId) -> String {
        format!("{stage}.dead")
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(&letter).map_err(BrokerError::Serialization)?;
        self.broker
            .publish_bytes(
                &self.exchange,
                &Self::routing_key(&letter.stage),
                body,
                PublishOptions::persistent_json(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DiscardKind;
    use crate::impls::InMemoryBroker;
    use chrono::Utc;

    #[tokio::test]
    async fn records_land_on_the_stage_dead_key() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx").await.unwrap();
        broker.declare_queue("s1_dead").await.unwrap();
        broker.bind_queue("s1_dead", "dlx", "s1.dead").await.unwrap();

        let sink = BrokerDeadLetterSink::new(Arc::new(broker.clone()), "dlx");
        let letter = DeadLetter::new(
            StageId::new("s1"),
            DiscardKind::Poison,
            "not json",
            b"garbage",
            1,
            Utc::now(),
        );
        sink.record(letter.clone()).await.unwrap();

        let bodies = broker.ready_bodies("s1_dead");
        assert_eq!(bodies.len(), 1);
        let back: DeadLetter = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(back, letter);
    }
}
