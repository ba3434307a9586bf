//! Pipeline - 複数 stage の組み立てと起動
//!
//! # 構成
//! - **PipelineSpec**: stage 定義の集合。`validate()` で鎖の整合性を起動前に検査する
//! - **PipelineBuilder**: stage id ごとに processor を割り当てる (Fail-fast)
//! - **Pipeline::start**: topology を宣言し、stage ごとに `instances` 本の worker を起動
//! - **PipelineHandle**: health probe の参照、shutdown 要求、join
//!
//! Stage N's output (exchange, routing key) must be consumed by at least one stage
//! whose expected input step is N's expected input step + 1. Several consumers of
//! the same key form a branch; several producers of one key are a fan-in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::health::HealthProbe;
use crate::app::stage::{StageProcessor, StageSpec};
use crate::app::worker::StageWorker;
use crate::domain::StageId;
use crate::impls::BrokerDeadLetterSink;
use crate::ports::{Broker, BrokerError, Clock, DeadLetterSink, ResultStore, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("duplicate stage id: {0}")]
    DuplicateStage(StageId),

    #[error("stage {stage}: `{field}` must not be empty")]
    EmptyName { stage: StageId, field: &'static str },

    #[error("stage {0}: instances must be at least 1")]
    NoInstances(StageId),

    #[error("stage {stage}: output {exchange}/{routing_key} is not consumed by any stage")]
    DanglingOutput {
        stage: StageId,
        exchange: String,
        routing_key: String,
    },

    #[error("stage {consumer} expects step {actual}, but its producer {producer} forwards step {expected}")]
    StepMismatch {
        producer: StageId,
        consumer: StageId,
        expected: u64,
        actual: u64,
    },

    #[error("stage {0}: expected step is too large to forward")]
    StepOverflow(StageId),

    #[error("queue {queue} is used by both {first} and {second}")]
    SharedQueue {
        queue: String,
        first: StageId,
        second: StageId,
    },

    #[error("no processor for stages: {0:?}")]
    MissingProcessors(Vec<StageId>),

    #[error("processor given for unknown stage: {0}")]
    UnknownStage(StageId),

    #[error("processor registered twice for stage: {0}")]
    DuplicateProcessor(StageId),

    #[error("topology declaration failed: {0}")]
    Topology(#[source] BrokerError),

    #[error("stage {stage} worker failed: {message}")]
    WorkerFailed { stage: StageId, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
    /// Exchange dead letters are published to. `None` disables recording.
    pub dead_letter_exchange: Option<String>,
}

impl PipelineSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn get(&self, id: &StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// Stages whose input is bound to `exchange` with `routing_key`.
    pub fn consumers_of<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> impl Iterator<Item = &'a StageSpec> + 'a {
        self.stages
            .iter()
            .filter(move |s| s.input.exchange == exchange && s.input.routing_key == routing_key)
    }

    /// Check the chain before anything is declared or consumed.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut ids = HashSet::new();
        let mut queues: HashMap<&str, &StageId> = HashMap::new();
        for stage in &self.stages {
            check_names(stage)?;
            if stage.instances == 0 {
                return Err(PipelineError::NoInstances(stage.id.clone()));
            }
            if !ids.insert(&stage.id) {
                return Err(PipelineError::DuplicateStage(stage.id.clone()));
            }
            if let Some(first) = queues.insert(&stage.input.queue, &stage.id) {
                return Err(PipelineError::SharedQueue {
                    queue: stage.input.queue.clone(),
                    first: first.clone(),
                    second: stage.id.clone(),
                });
            }
        }

        for producer in &self.stages {
            let Some(output) = &producer.output else {
                continue;
            };
            let forwarded_step = producer
                .input
                .expected_step
                .checked_add(1)
                .ok_or_else(|| PipelineError::StepOverflow(producer.id.clone()))?;
            for routing_key in &output.routing_keys {
                let mut consumed = false;
                for consumer in self.consumers_of(&output.exchange, routing_key) {
                    consumed = true;
                    if consumer.input.expected_step != forwarded_step {
                        return Err(PipelineError::StepMismatch {
                            producer: producer.id.clone(),
                            consumer: consumer.id.clone(),
                            expected: forwarded_step,
                            actual: consumer.input.expected_step,
                        });
                    }
                }
                if !consumed {
                    return Err(PipelineError::DanglingOutput {
                        stage: producer.id.clone(),
                        exchange: output.exchange.clone(),
                        routing_key: routing_key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Declare every exchange, queue and binding the pipeline uses. Idempotent.
    ///
    /// With a dead-letter exchange, each stage also gets a `<stage>.dead` queue
    /// bound with the same routing key.
    pub async fn declare_topology(&self, broker: &dyn Broker) -> Result<(), PipelineError> {
        for stage in &self.stages {
            let input = &stage.input;
            broker
                .declare_exchange(&input.exchange)
                .await
                .map_err(PipelineError::Topology)?;
            broker
                .declare_queue(&input.queue)
                .await
                .map_err(PipelineError::Topology)?;
            broker
                .bind_queue(&input.queue, &input.exchange, &input.routing_key)
                .await
                .map_err(PipelineError::Topology)?;
        }

        for stage in &self.stages {
            if let Some(output) = &stage.output {
                broker
                    .declare_exchange(&output.exchange)
                    .await
                    .map_err(PipelineError::Topology)?;
            }
        }

        if let Some(dlx) = &self.dead_letter_exchange {
            broker
                .declare_exchange(dlx)
                .await
                .map_err(PipelineError::Topology)?;
            for stage in &self.stages {
                let key = BrokerDeadLetterSink::routing_key(&stage.id);
                broker
                    .declare_queue(&key)
                    .await
                    .map_err(PipelineError::Topology)?;
                broker
                    .bind_queue(&key, dlx, &key)
                    .await
                    .map_err(PipelineError::Topology)?;
            }
        }

        info!(stages = self.stages.len(), "pipeline topology declared");
        Ok(())
    }
}

fn check_names(stage: &StageSpec) -> Result<(), PipelineError> {
    let empty = |field| PipelineError::EmptyName {
        stage: stage.id.clone(),
        field,
    };
    if stage.id.as_str().is_empty() {
        return Err(empty("id"));
    }
    if stage.input.exchange.is_empty() {
        return Err(empty("input.exchange"));
    }
    if stage.input.queue.is_empty() {
        return Err(empty("input.queue"));
    }
    if stage.input.routing_key.is_empty() {
        return Err(empty("input.routing_key"));
    }
    if let Some(output) = &stage.output {
        if output.exchange.is_empty() {
            return Err(empty("output.exchange"));
        }
        if output.routing_keys.is_empty() || output.routing_keys.iter().any(String::is_empty) {
            return Err(empty("output.routing_keys"));
        }
    }
    Ok(())
}

/// Attaches processors to stages.
///
/// ```ignore
/// let pipeline = PipelineBuilder::new(spec)
///     .processor("service1", annotate)?
///     .processor("service2", annotate)?
///     .result_store(store)
///     .build()?;
/// ```
///
/// `build()` fails unless every stage has exactly one processor.
pub struct PipelineBuilder {
    spec: PipelineSpec,
    processors: HashMap<StageId, Arc<dyn StageProcessor>>,
    results: Option<Arc<dyn ResultStore>>,
    clock: Arc<dyn Clock>,
}

impl PipelineBuilder {
    pub fn new(spec: PipelineSpec) -> Self {
        Self {
            spec,
            processors: HashMap::new(),
            results: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn processor(
        self,
        stage: impl Into<StageId>,
        processor: impl StageProcessor + 'static,
    ) -> Result<Self, PipelineError> {
        self.shared_processor(stage, Arc::new(processor))
    }

    pub fn shared_processor(
        mut self,
        stage: impl Into<StageId>,
        processor: Arc<dyn StageProcessor>,
    ) -> Result<Self, PipelineError> {
        let stage = stage.into();
        if self.spec.get(&stage).is_none() {
            return Err(PipelineError::UnknownStage(stage));
        }
        if self.processors.contains_key(&stage) {
            return Err(PipelineError::DuplicateProcessor(stage));
        }
        self.processors.insert(stage, processor);
        Ok(self)
    }

    /// Where terminal stages store finished envelopes.
    pub fn result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.results = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.spec.validate()?;

        let missing: Vec<StageId> = self
            .spec
            .stages
            .iter()
            .filter(|s| !self.processors.contains_key(&s.id))
            .map(|s| s.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingProcessors(missing));
        }

        Ok(Pipeline {
            spec: self.spec,
            processors: self.processors,
            results: self.results,
            clock: self.clock,
        })
    }
}

/// A validated pipeline, ready to start.
pub struct Pipeline {
    spec: PipelineSpec,
    processors: HashMap<StageId, Arc<dyn StageProcessor>>,
    results: Option<Arc<dyn ResultStore>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Declare topology, then spawn every worker.
    ///
    /// Topology failures are returned before any worker consumes.
    pub async fn start(&self, broker: Arc<dyn Broker>) -> Result<PipelineHandle, PipelineError> {
        self.spec.declare_topology(broker.as_ref()).await?;

        let dead_letters: Option<Arc<dyn DeadLetterSink>> =
            self.spec.dead_letter_exchange.as_ref().map(|dlx| {
                Arc::new(BrokerDeadLetterSink::new(Arc::clone(&broker), dlx.clone()))
                    as Arc<dyn DeadLetterSink>
            });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        for stage in &self.spec.stages {
            let Some(processor) = self.processors.get(&stage.id) else {
                return Err(PipelineError::MissingProcessors(vec![stage.id.clone()]));
            };
            let spec = Arc::new(stage.clone());

            for instance in 0..stage.instances {
                let mut worker = StageWorker::new(
                    Arc::clone(&spec),
                    Arc::clone(processor),
                    Arc::clone(&broker),
                )
                .with_clock(Arc::clone(&self.clock));
                if let Some(sink) = &dead_letters {
                    worker = worker.with_dead_letters(Arc::clone(sink));
                }
                if stage.is_terminal()
                    && let Some(store) = &self.results
                {
                    worker = worker.with_results(Arc::clone(store));
                }

                let health = worker.health();
                let rx = shutdown_rx.clone();
                let join = tokio::spawn(async move { worker.run(rx).await });

                workers.push(WorkerSlot {
                    stage: stage.id.clone(),
                    instance,
                    health,
                    join,
                });
            }
        }

        info!(workers = workers.len(), "pipeline started");
        Ok(PipelineHandle {
            shutdown_tx,
            workers,
        })
    }
}

#[derive(Debug)]
struct WorkerSlot {
    stage: StageId,
    instance: usize,
    health: HealthProbe,
    join: JoinHandle<Result<(), BrokerError>>,
}

/// Health of one running worker.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub stage: StageId,
    pub instance: usize,
    pub probe: HealthProbe,
}

/// Running pipeline.
/// - `request_shutdown()` で新規 delivery の受け取りを止める (処理中のものは settle まで続く)
/// - `shutdown_and_join()` で全 worker の終了を待つ
#[derive(Debug)]
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerSlot>,
}

impl PipelineHandle {
    pub fn health(&self) -> Vec<WorkerHealth> {
        self.workers
            .iter()
            .map(|w| WorkerHealth {
                stage: w.stage.clone(),
                instance: w.instance,
                probe: w.health.clone(),
            })
            .collect()
    }

    pub fn all_accepting(&self) -> bool {
        self.workers.iter().all(|w| w.health.is_accepting())
    }

    /// Number of workers whose task has already returned.
    pub fn finished(&self) -> usize {
        self.workers.iter().filter(|w| w.join.is_finished()).count()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop every worker and wait for them. Reports the first worker that ended
    /// with an error (lost subscription or panic).
    pub async fn shutdown_and_join(self) -> Result<(), PipelineError> {
        self.request_shutdown();

        let mut first_failure = None;
        for slot in self.workers {
            let message = match slot.join.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(join_err) => join_err.to_string(),
            };
            error!(stage = %slot.stage, instance = slot.instance, %message, "worker failed");
            if first_failure.is_none() {
                first_failure = Some(PipelineError::WorkerFailed {
                    stage: slot.stage,
                    message,
                });
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
