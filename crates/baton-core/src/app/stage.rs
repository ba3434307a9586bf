//! Stage definition: bindings, processor and failure policy of one step.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{ClassificationTable, Envelope, RedeliveryPolicy, StageError, StageId};

/// The domain work of a stage.
///
/// Receives an owned copy of the envelope and returns the enriched envelope.
/// It may add or overwrite payload keys; it must not drop keys, change `id`,
/// `created_at` or `step` (the worker checks). The same input may be processed
/// more than once after a redelivery, so implementations must be idempotent.
///
/// Closures `Fn(Envelope) -> impl Future<Output = Result<Envelope, StageError>>`
/// implement this trait directly.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, envelope: Envelope) -> Result<Envelope, StageError>;
}

#[async_trait]
impl<F, Fut> StageProcessor for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Envelope, StageError>> + Send + 'static,
{
    async fn process(&self, envelope: Envelope) -> Result<Envelope, StageError> {
        (self)(envelope).await
    }
}

/// Where a stage reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    /// `step` an envelope must carry when it arrives here.
    pub expected_step: u64,
}

impl InputBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        expected_step: u64,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            expected_step,
        }
    }
}

/// Where a stage forwards to. Several routing keys branch the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBinding {
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

impl OutputBinding {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_keys: vec![routing_key.into()],
        }
    }

    pub fn also(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_keys.push(routing_key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub input: InputBinding,
    /// `None` for a terminal stage.
    pub output: Option<OutputBinding>,
    /// Concurrent workers on the input queue.
    pub instances: usize,
    pub classification: ClassificationTable,
    pub redelivery: RedeliveryPolicy,
}

impl StageSpec {
    pub fn new(id: impl Into<StageId>, input: InputBinding) -> Self {
        Self {
            id: id.into(),
            input,
            output: None,
            instances: 1,
            classification: ClassificationTable::new(),
            redelivery: RedeliveryPolicy::unlimited(),
        }
    }

    pub fn forward_to(mut self, output: OutputBinding) -> Self {
        self.output = Some(output);
        self
    }

    pub fn instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn classify(mut self, classification: ClassificationTable) -> Self {
        self.classification = classification;
        self
    }

    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.output.is_none()
    }
}
