//! Ingress - turns an inbound document into the first envelope of a chain.

use std::sync::Arc;

use tracing::info;

use crate::domain::{Envelope, EnvelopeId, Payload};
use crate::ports::{Broker, BrokerError, Clock, IdGenerator, SystemClock, UlidGenerator};

/// `source` of every envelope created here.
pub const INGRESS_SOURCE: &str = "ingress";

pub struct Ingress {
    broker: Arc<dyn Broker>,
    exchange: String,
    routing_key: String,
    initial_step: u64,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Ingress {
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        initial_step: u64,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            initial_step,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wrap `payload` in a new envelope and publish it. Returns the assigned id.
    pub async fn submit(&self, payload: Payload) -> Result<EnvelopeId, BrokerError> {
        let envelope = Envelope::originate(
            self.ids.generate_envelope_id(),
            payload,
            self.clock.now(),
            INGRESS_SOURCE,
            self.initial_step,
        );
        self.broker
            .publish(&self.exchange, &self.routing_key, &envelope)
            .await?;
        info!(
            envelope_id = %envelope.id(),
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            step = envelope.step(),
            "envelope submitted"
        );
        Ok(envelope.id().clone())
    }
}
