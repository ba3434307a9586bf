//! StageWorker - the consume loop of one stage.
//!
//! # Flow per delivery
//! 1. decode the body into an `Envelope` (failure: discard)
//! 2. check `step` against the stage's expected input step (mismatch: discard)
//! 3. run the processor; classify failures as requeue / discard
//! 4. stamp `source`, bump `step`, forward to every output routing key
//!    (publish failure: requeue, the whole step is redone on redelivery)
//! 5. terminal stage: store the result and acknowledge
//!
//! The redelivery policy and dead-letter sink run after that, then the delivery is
//! settled with the broker. Nothing is kept between deliveries, so any number of
//! workers may share one input queue.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app::health::HealthProbe;
use crate::app::stage::{StageProcessor, StageSpec};
use crate::domain::{
    DeadLetter, Decision, Envelope, ErrorClassifier, ErrorKind, StageOutcome,
};
use crate::ports::{
    Broker, BrokerError, Clock, DeadLetterSink, Delivery, ResultStore, StoreError, SystemClock,
    settle,
};

pub struct StageWorker {
    spec: Arc<StageSpec>,
    processor: Arc<dyn StageProcessor>,
    broker: Arc<dyn Broker>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    results: Option<Arc<dyn ResultStore>>,
    clock: Arc<dyn Clock>,
    health: HealthProbe,
}

impl StageWorker {
    pub fn new(
        spec: Arc<StageSpec>,
        processor: Arc<dyn StageProcessor>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            health: HealthProbe::linked(Arc::clone(&broker)),
            spec,
            processor,
            broker,
            dead_letters: None,
            results: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Store finished envelopes (terminal stages only).
    pub fn with_results(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.results = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn health(&self) -> HealthProbe {
        self.health.clone()
    }

    /// Consume until shutdown is requested or the subscription ends.
    ///
    /// A delivery that is already being processed when shutdown arrives is finished
    /// and settled first. The health probe reports "not accepting" from the moment
    /// shutdown is observed, including while that last delivery drains. Returns an
    /// error if the subscription could not be opened or was lost without a shutdown
    /// request.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        let mut subscription = self.broker.consume(&self.spec.input.queue).await?;
        self.health.set_accepting(true);
        info!(
            stage = %self.spec.id,
            queue = %self.spec.input.queue,
            expected_step = self.spec.input.expected_step,
            "stage worker consuming"
        );

        let result = loop {
            // shutdown が来ていたら抜ける
            if *shutdown.borrow() {
                break Ok(());
            }

            let delivery = tokio::select! {
                changed = shutdown.changed() => {
                    // sender が drop されたら停止扱い
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                delivery = subscription.next() => delivery,
            };

            let Some(delivery) = delivery else {
                warn!(stage = %self.spec.id, "subscription ended, broker connection lost");
                break Err(BrokerError::Unavailable(format!(
                    "subscription on {} ended",
                    self.spec.input.queue
                )));
            };

            self.finish_delivery(delivery, &mut shutdown).await;
        };

        self.health.set_accepting(false);
        info!(stage = %self.spec.id, "stage worker stopped");
        result
    }

    /// `process_delivery`, while still watching for shutdown. The delivery is never
    /// cancelled; a shutdown request only clears the health flag early.
    async fn finish_delivery(&self, delivery: Box<dyn Delivery>, shutdown: &mut watch::Receiver<bool>) {
        let work = self.process_delivery(delivery);
        tokio::pin!(work);

        loop {
            let changed = tokio::select! {
                _ = &mut work => return,
                changed = shutdown.changed() => changed,
            };
            // sender の drop も停止要求として扱う
            if changed.is_err() || *shutdown.borrow() {
                break;
            }
        }

        self.health.set_accepting(false);
        info!(stage = %self.spec.id, "shutdown requested, draining in-flight delivery");
        work.await;
    }

    /// Handle one delivery end to end and settle it. Returns what the broker was told.
    pub async fn process_delivery(&self, delivery: Box<dyn Delivery>) -> StageOutcome {
        let delivery_count = delivery.delivery_count();
        let decision = self.handle(delivery.body()).await;
        let decision = self.spec.redelivery.apply(delivery_count, decision);
        let decision = self
            .record_discard(decision, delivery.body(), delivery_count)
            .await;

        let outcome = decision.outcome();
        match &decision {
            Decision::Ack => debug!(stage = %self.spec.id, "delivery acknowledged"),
            Decision::Requeue { reason } => {
                warn!(stage = %self.spec.id, delivery_count, %reason, "delivery requeued")
            }
            Decision::Discard { kind, reason } => {
                warn!(stage = %self.spec.id, delivery_count, ?kind, %reason, "delivery discarded")
            }
        }

        if let Err(err) = settle(delivery, outcome).await {
            // 接続断なら broker 側で再配送される
            warn!(stage = %self.spec.id, %outcome, error = %err, "settling delivery failed");
        }
        outcome
    }

    /// Decide what to do with one raw message body. Performs the forward publish
    /// (or result store write) but does not touch the delivery itself.
    pub async fn handle(&self, body: &[u8]) -> Decision {
        let stage = &self.spec.id;

        let envelope = match Envelope::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                match Envelope::peek_id(body) {
                    Some(id) => {
                        warn!(%stage, envelope_id = %id, error = %err, "malformed envelope")
                    }
                    None => {
                        warn!(%stage, bytes = body.len(), error = %err, "opaque malformed payload")
                    }
                }
                return Decision::poison(format!("malformed envelope: {err}"));
            }
        };

        let id = envelope.id().clone();
        let step = envelope.step();
        let expected = self.spec.input.expected_step;
        if step != expected {
            warn!(%stage, envelope_id = %id, step, expected, "step mismatch");
            return Decision::poison(format!("step mismatch: expected {expected}, got {step}"));
        }

        debug!(%stage, envelope_id = %id, step, "processing");
        let input = envelope.clone();
        let mut output = match self.processor.process(envelope).await {
            Ok(output) => output,
            Err(err) => {
                let kind = self.spec.classification.classify(&err);
                warn!(
                    %stage,
                    envelope_id = %id,
                    condition = err.condition(),
                    ?kind,
                    error = %err,
                    "processing failed"
                );
                return match kind {
                    ErrorKind::Transient => Decision::requeue(format!("transient: {err}")),
                    ErrorKind::Permanent => Decision::poison(format!("permanent: {err}")),
                };
            }
        };

        if let Some(violation) = output.additive_violation(&input) {
            error!(%stage, envelope_id = %id, %violation, "processor broke the envelope contract");
            return Decision::poison(format!("envelope contract violated: {violation}"));
        }
        if output.step() != step {
            error!(%stage, envelope_id = %id, step = output.step(), "processor changed step");
            return Decision::poison("envelope contract violated: step changed by processor");
        }

        output.restore_extra(&input);
        if let Err(err) = output.advance(stage) {
            error!(%stage, envelope_id = %id, error = %err, "cannot advance envelope");
            return Decision::poison(err.to_string());
        }

        match &self.spec.output {
            Some(binding) => {
                for routing_key in &binding.routing_keys {
                    if let Err(err) = self
                        .broker
                        .publish(&binding.exchange, routing_key, &output)
                        .await
                    {
                        warn!(
                            %stage,
                            envelope_id = %id,
                            exchange = %binding.exchange,
                            %routing_key,
                            error = %err,
                            "forward publish failed"
                        );
                        return match err {
                            BrokerError::Serialization(_) => {
                                Decision::poison(format!("cannot encode envelope: {err}"))
                            }
                            _ => Decision::requeue(format!("forward to {routing_key} failed: {err}")),
                        };
                    }
                }
                info!(
                    %stage,
                    envelope_id = %id,
                    step = output.step(),
                    exchange = %binding.exchange,
                    "forwarded"
                );
            }
            None => {
                if let Some(store) = &self.results {
                    match store.create(output.clone()).await {
                        Ok(()) => {}
                        Err(StoreError::AlreadyExists(_)) => {
                            debug!(%stage, envelope_id = %id, "result already stored, redelivery")
                        }
                        Err(err) => {
                            warn!(%stage, envelope_id = %id, error = %err, "storing result failed");
                            return Decision::requeue(format!("result store: {err}"));
                        }
                    }
                }
                info!(
                    %stage,
                    envelope_id = %id,
                    step = output.step(),
                    payload = %serde_json::Value::Object(output.payload().clone()),
                    "chain complete"
                );
            }
        }

        Decision::Ack
    }

    /// Send discards to the dead-letter sink. If that fails the message is requeued
    /// instead, so it is never dropped without a trace.
    async fn record_discard(&self, decision: Decision, body: &[u8], delivery_count: u32) -> Decision {
        let (kind, reason) = match decision {
            Decision::Discard { kind, reason } => (kind, reason),
            other => return other,
        };
        let Some(sink) = &self.dead_letters else {
            return Decision::Discard { kind, reason };
        };

        let letter = DeadLetter::new(
            self.spec.id.clone(),
            kind,
            reason.clone(),
            body,
            delivery_count,
            self.clock.now(),
        );
        match sink.record(letter).await {
            Ok(()) => Decision::Discard { kind, reason },
            Err(err) => {
                error!(stage = %self.spec.id, error = %err, "dead-letter publish failed");
                Decision::requeue(format!("dead-letter sink unavailable: {err}"))
            }
        }
    }
}
