//! Broker port - durable queue/exchange transport between stages.
//!
//! The broker is an external collaborator. This module only fixes the contract a
//! transport has to honour:
//!
//! - declarations are idempotent (every stage re-declares what it touches on startup)
//! - publishes are persistent
//! - consumption is manual-ack: a delivery stays locked to one consumer until it is
//!   settled, and comes back (marked redelivered) if it is dropped unsettled

use async_trait::async_trait;

use crate::domain::{Envelope, StageOutcome};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("message serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("exchange not declared: {0}")]
    UnknownExchange(String),

    #[error("queue not declared: {0}")]
    UnknownQueue(String),

    #[error("delivery already settled or channel closed")]
    Closed,

    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),
}

impl BrokerError {
    /// Errors a redelivery might get past.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Survives a broker restart.
    pub persistent: bool,
    pub content_type: &'static str,
}

impl PublishOptions {
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: CONTENT_TYPE_JSON,
        }
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::persistent_json()
    }
}

/// One message handed to one consumer. Must be settled exactly once.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// 1 on first delivery, +1 on every redelivery.
    fn delivery_count(&self) -> u32;

    fn redelivered(&self) -> bool {
        self.delivery_count() > 1
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// Manual-ack consumer on one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` means the connection is gone for good.
    async fn next(&mut self) -> Option<Box<dyn Delivery>>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Serialize and publish an envelope as a persistent JSON message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(envelope).map_err(BrokerError::Serialization)?;
        self.publish_bytes(exchange, routing_key, body, PublishOptions::persistent_json())
            .await
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Whether the connection is usable right now. Transports that cannot tell
    /// report `true`.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Translate a stage outcome into the matching broker call.
pub async fn settle(delivery: Box<dyn Delivery>, outcome: StageOutcome) -> Result<(), BrokerError> {
    match outcome {
        StageOutcome::Ack => delivery.ack().await,
        StageOutcome::RetryRequeue => delivery.nack(true).await,
        StageOutcome::DiscardPoison => delivery.nack(false).await,
    }
}
