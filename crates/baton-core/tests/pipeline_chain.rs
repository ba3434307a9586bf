//! End-to-end chains over the in-process broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::watch;

use baton_core::app::{
    InputBinding, Ingress, OutputBinding, PipelineBuilder, PipelineSpec, StageSpec, StageWorker,
};
use baton_core::config::parse_pipeline_str;
use baton_core::domain::{
    ClassificationTable, DeadLetter, DiscardKind, Envelope, EnvelopeId, RedeliveryPolicy,
    StageError,
};
use baton_core::impls::{InMemoryBroker, InMemoryResultStore};
use baton_core::ports::{Broker, PublishOptions, ResultStore};

const WAIT: Duration = Duration::from_secs(3);

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn stage(id: &str, step: u64) -> StageSpec {
    StageSpec::new(
        id,
        InputBinding::new(
            format!("{id}_exchange"),
            format!("{id}_queue"),
            format!("{id}.process"),
            step,
        ),
    )
}

fn linked(id: &str, step: u64, next: &str) -> StageSpec {
    stage(id, step).forward_to(OutputBinding::new(
        format!("{next}_exchange"),
        format!("{next}.process"),
    ))
}

fn three_stages() -> PipelineSpec {
    PipelineSpec::new()
        .stage(linked("s1", 0, "s2"))
        .stage(linked("s2", 1, "s3"))
        .stage(stage("s3", 2))
}

fn first_envelope(step: u64) -> Envelope {
    Envelope::originate(
        EnvelopeId::new("abc"),
        json!({"x": 1}).as_object().cloned().unwrap(),
        Utc::now(),
        "ingress",
        step,
    )
}

/// Processor that sets `<key>: true` and counts its calls.
fn mark(
    key: impl Into<String>,
    calls: Arc<AtomicUsize>,
) -> impl Fn(Envelope) -> std::future::Ready<Result<Envelope, StageError>> + Send + Sync + 'static
{
    let key = key.into();
    move |env: Envelope| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(env.with(key.clone(), true)))
    }
}

fn counters<const N: usize>() -> [Arc<AtomicUsize>; N] {
    std::array::from_fn(|_| Arc::new(AtomicUsize::new(0)))
}

async fn stored(store: &InMemoryResultStore, id: &str) -> Option<Envelope> {
    store.get_by_id(&EnvelopeId::new(id)).await.unwrap()
}

#[tokio::test]
async fn three_stage_chain_accumulates_every_key() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryResultStore::new());
    let [c1, c2, c3] = counters::<3>();

    let pipeline = PipelineBuilder::new(three_stages())
        .processor("s1", mark("s1", c1))
        .unwrap()
        .processor("s2", mark("s2", c2))
        .unwrap()
        .processor("s3", mark("s3", c3))
        .unwrap()
        .result_store(store.clone())
        .build()
        .unwrap();
    let handle = pipeline.start(Arc::new(broker.clone())).await.unwrap();

    broker
        .publish("s1_exchange", "s1.process", &first_envelope(0))
        .await
        .unwrap();

    eventually("terminal result", || store.len() == 1).await;
    let done = stored(&store, "abc").await.unwrap();

    assert_eq!(done.id().as_str(), "abc");
    assert_eq!(done.step(), 3);
    assert_eq!(done.source(), "s3");
    assert_eq!(
        Value::Object(done.payload().clone()),
        json!({"x": 1, "s1": true, "s2": true, "s3": true})
    );

    handle.shutdown_and_join().await.unwrap();
    for q in ["s1_queue", "s2_queue", "s3_queue"] {
        let stats = broker.queue_stats(q).unwrap();
        assert_eq!((stats.ready, stats.unacked, stats.acked), (0, 0, 1), "{q}");
    }
}

#[tokio::test]
async fn failed_forward_is_redone_and_delivered_once() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryResultStore::new());
    let [c1, c2, c3] = counters::<3>();

    let pipeline = PipelineBuilder::new(three_stages())
        .processor("s1", mark("s1", c1))
        .unwrap()
        .processor("s2", mark("s2", c2.clone()))
        .unwrap()
        .processor("s3", mark("s3", c3.clone()))
        .unwrap()
        .result_store(store.clone())
        .build()
        .unwrap();
    let handle = pipeline.start(Arc::new(broker.clone())).await.unwrap();

    // stage 2 の forward を 1 回だけ失敗させる
    broker.fail_publishes("s3_exchange", 1);
    broker
        .publish("s1_exchange", "s1.process", &first_envelope(0))
        .await
        .unwrap();

    eventually("terminal result", || store.len() == 1).await;
    handle.shutdown_and_join().await.unwrap();

    assert_eq!(c2.load(Ordering::SeqCst), 2, "stage 2 redone after requeue");
    assert_eq!(c3.load(Ordering::SeqCst), 1, "exactly one final delivery");
    assert_eq!(store.len(), 1);
    let s2 = broker.queue_stats("s2_queue").unwrap();
    assert_eq!((s2.acked, s2.discarded, s2.ready), (1, 0, 0));
}

#[tokio::test]
async fn malformed_and_out_of_step_messages_are_discarded() {
    let broker = InMemoryBroker::new();
    let [c1, c2, c3] = counters::<3>();

    let pipeline = PipelineBuilder::new(three_stages())
        .processor("s1", mark("s1", c1.clone()))
        .unwrap()
        .processor("s2", mark("s2", c2.clone()))
        .unwrap()
        .processor("s3", mark("s3", c3))
        .unwrap()
        .build()
        .unwrap();
    let handle = pipeline.start(Arc::new(broker.clone())).await.unwrap();

    // step が 2 つ先
    broker
        .publish("s1_exchange", "s1.process", &first_envelope(2))
        .await
        .unwrap();
    broker
        .publish_bytes(
            "s1_exchange",
            "s1.process",
            b"{\"id\": \"abc\", \"data\": ".to_vec(),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    broker
        .publish_bytes("s1_exchange", "s1.process", vec![0xff, 0x00, 0x13], PublishOptions::default())
        .await
        .unwrap();

    eventually("three discards", || {
        broker.queue_stats("s1_queue").unwrap().discarded == 3
    })
    .await;
    handle.shutdown_and_join().await.unwrap();

    assert_eq!(c1.load(Ordering::SeqCst), 0);
    assert_eq!(c2.load(Ordering::SeqCst), 0);
    let s1 = broker.queue_stats("s1_queue").unwrap();
    assert_eq!((s1.ready, s1.unacked, s1.acked), (0, 0, 0));
    assert_eq!(broker.queue_stats("s2_queue").unwrap().acked, 0);
}

#[tokio::test]
async fn exhausted_redeliveries_land_in_dead_letters() {
    let broker = InMemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let spec = PipelineSpec::new()
        .stage(
            linked("s1", 0, "s2")
                .classify(ClassificationTable::new().transient("downstream_busy"))
                .redelivery(RedeliveryPolicy::at_most(3)),
        )
        .stage(stage("s2", 1))
        .dead_letter_exchange("pipeline.dead_letter");

    let pipeline = PipelineBuilder::new(spec)
        .processor("s1", move |_env: Envelope| {
            seen.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<Envelope, _>(StageError::new(
                "downstream_busy",
                "inventory service did not answer",
            )))
        })
        .unwrap()
        .processor("s2", mark("s2", Arc::new(AtomicUsize::new(0))))
        .unwrap()
        .build()
        .unwrap();
    let handle = pipeline.start(Arc::new(broker.clone())).await.unwrap();

    broker
        .publish("s1_exchange", "s1.process", &first_envelope(0))
        .await
        .unwrap();

    eventually("dead letter", || broker.ready_bodies("s1.dead").len() == 1).await;
    handle.shutdown_and_join().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let letter: DeadLetter = serde_json::from_slice(&broker.ready_bodies("s1.dead")[0]).unwrap();
    assert_eq!(letter.kind, DiscardKind::Exhausted);
    assert_eq!(letter.delivery_count, 3);
    assert_eq!(letter.envelope_id, Some(EnvelopeId::new("abc")));
    assert!(letter.reason.contains("downstream_busy"));

    let s1 = broker.queue_stats("s1_queue").unwrap();
    assert_eq!((s1.ready, s1.discarded), (0, 1));
}

#[tokio::test]
async fn delivery_of_a_crashed_worker_goes_to_another_worker() {
    let broker = InMemoryBroker::new();
    let spec = PipelineSpec::new()
        .stage(linked("s1", 0, "s2"))
        .stage(stage("s2", 1));
    spec.declare_topology(&broker).await.unwrap();
    let s1 = Arc::new(spec.stages[0].clone());

    broker
        .publish("s1_exchange", "s1.process", &first_envelope(0))
        .await
        .unwrap();

    // 1 本目: 処理中に止まる
    let stuck = StageWorker::new(
        s1.clone(),
        Arc::new(|_env: Envelope| std::future::pending::<Result<Envelope, StageError>>()),
        Arc::new(broker.clone()),
    );
    let (_tx, rx) = watch::channel(false);
    let crashed = tokio::spawn(async move { stuck.run(rx).await });

    eventually("in-flight delivery", || {
        broker.queue_stats("s1_queue").unwrap().unacked == 1
    })
    .await;
    crashed.abort();
    assert!(crashed.await.unwrap_err().is_cancelled());
    assert_eq!(broker.queue_stats("s1_queue").unwrap().ready, 1);

    // 2 本目が引き継ぐ
    let calls = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(StageWorker::new(
        s1,
        Arc::new(mark("s1", calls.clone())),
        Arc::new(broker.clone()),
    ));
    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let healthy = healthy.clone();
        async move { healthy.run(rx).await }
    });

    eventually("forwarded envelope", || broker.ready_bodies("s2_queue").len() == 1).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let forwarded = Envelope::from_slice(&broker.ready_bodies("s2_queue")[0]).unwrap();
    assert_eq!(forwarded.step(), 1);
    assert_eq!(forwarded.get("s1"), Some(&json!(true)));
    assert_eq!(broker.queue_stats("s1_queue").unwrap().acked, 1);
}

#[tokio::test]
async fn persistent_messages_survive_a_broker_restart() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryResultStore::new());
    let spec = three_stages();
    spec.declare_topology(&broker).await.unwrap();

    broker
        .publish("s1_exchange", "s1.process", &first_envelope(0))
        .await
        .unwrap();
    broker.restart();
    assert_eq!(broker.ready_bodies("s1_queue").len(), 1);

    let [c1, c2, c3] = counters::<3>();
    let pipeline = PipelineBuilder::new(spec)
        .processor("s1", mark("s1", c1))
        .unwrap()
        .processor("s2", mark("s2", c2))
        .unwrap()
        .processor("s3", mark("s3", c3))
        .unwrap()
        .result_store(store.clone())
        .build()
        .unwrap();
    let handle = pipeline.start(Arc::new(broker.clone())).await.unwrap();

    eventually("terminal result", || store.len() == 1).await;
    handle.shutdown_and_join().await.unwrap();
    assert_eq!(stored(&store, "abc").await.unwrap().step(), 3);
}

#[tokio::test]
async fn branching_delivers_to_every_branch() {
    let broker = InMemoryBroker::new();
    let spec = PipelineSpec::new()
        .stage(stage("root", 0).forward_to(
            OutputBinding::new("fan_exchange", "left.process").also("right.process"),
        ))
        .stage(StageSpec::new(
            "left",
            InputBinding::new("fan_exchange", "left_queue", "left.process", 1),
        ))
        .stage(StageSpec::new(
            "right",
            InputBinding::new("fan_exchange", "right_queue", "right.process", 1),
        ));

    let [root, left, right] = counters::<3>();
    let pipeline = PipelineBuilder::new(spec)
        .processor("root", mark("root", root))
        .unwrap()
        .processor("left", mark("left", left.clone()))
        .unwrap()
        .processor("right", mark("right", right.clone()))
        .unwrap()
        .build()
        .unwrap();
    let handle = pipeline.start(Arc::new(broker.clone())).await.unwrap();

    broker
        .publish("root_exchange", "root.process", &first_envelope(0))
        .await
        .unwrap();

    eventually("both branches", || {
        left.load(Ordering::SeqCst) == 1 && right.load(Ordering::SeqCst) == 1
    })
    .await;
    handle.shutdown_and_join().await.unwrap();
}

#[tokio::test]
async fn configured_pipeline_runs_from_ingress_to_result() {
    let yaml = r#"
ingress:
  exchange: service1_exchange
  routing_key: service1.process
stages:
  - id: service1
    processor: mark
    input: { exchange: service1_exchange, queue: service1_queue, routing_key: service1.process, expected_step: 0 }
    output: { exchange: service2_exchange, routing_keys: [service2.process] }
    instances: 2
  - id: service2
    processor: mark
    input: { exchange: service2_exchange, queue: service2_queue, routing_key: service2.process, expected_step: 1 }
"#;
    let config = parse_pipeline_str(yaml).unwrap();
    let spec = config.validate().unwrap();

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryResultStore::new());
    let mut builder = PipelineBuilder::new(spec).result_store(store.clone());
    for (stage, _name) in config.processors() {
        let key = format!("{stage}_processed");
        builder = builder
            .processor(stage, mark(key, Arc::new(AtomicUsize::new(0))))
            .unwrap();
    }
    let handle = builder.build().unwrap().start(broker.clone()).await.unwrap();

    let ingress_config = config.ingress.as_ref().unwrap();
    let ingress = Ingress::new(
        broker,
        ingress_config.exchange.clone(),
        ingress_config.routing_key.clone(),
        ingress_config.initial_step,
    );
    let id = ingress
        .submit(json!({"order": 42}).as_object().cloned().unwrap())
        .await
        .unwrap();

    eventually("terminal result", || store.len() == 1).await;
    assert!(handle.all_accepting());
    handle.shutdown_and_join().await.unwrap();

    let done = store.get_by_id(&id).await.unwrap().unwrap();
    assert_eq!(done.step(), 2);
    assert_eq!(done.source(), "service2");
    assert_eq!(done.get("order"), Some(&json!(42)));
    assert_eq!(done.get("service1_processed"), Some(&json!(true)));
    assert_eq!(done.get("service2_processed"), Some(&json!(true)));
}
