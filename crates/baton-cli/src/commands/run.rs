use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use baton_core::app::{Ingress, PipelineHandle};
use baton_core::domain::{EnvelopeId, Payload};
use baton_core::impls::{self, InMemoryResultStore};
use baton_core::ports::ResultStore;

use crate::signal;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Execute the `run` command: start every stage, optionally submit documents,
/// then run until a signal arrives (or, with `until_done`, until every submitted
/// document has reached a terminal stage).
pub async fn execute(pipeline_path: &Path, submit: &[String], until_done: bool) -> Result<()> {
    // 1. Parse + validate
    let (config, spec) = super::load(pipeline_path)?;

    let payloads = submit
        .iter()
        .map(|doc| parse_payload(doc))
        .collect::<Result<Vec<_>>>()?;
    if !payloads.is_empty() && config.ingress.is_none() {
        bail!("--submit needs an `ingress` section in {}", pipeline_path.display());
    }

    // 2. Wire up
    let results = Arc::new(InMemoryResultStore::new());
    let pipeline = super::builder(&config, spec)?
        .result_store(results.clone())
        .build()?;
    let broker = impls::connect(&config.broker.url)
        .with_context(|| format!("Failed to connect to broker: {}", config.broker.url))?;

    // 3. Start (topology failures surface here, before anything is consumed)
    let handle = pipeline.start(Arc::clone(&broker)).await?;
    tracing::info!(
        stages = pipeline.spec().stages.len(),
        workers = handle.health().len(),
        broker = %config.broker.url,
        "Pipeline running"
    );

    // 4. Submit
    let mut submitted = Vec::new();
    if let Some(ingress) = &config.ingress {
        let ingress = Ingress::new(
            Arc::clone(&broker),
            ingress.exchange.clone(),
            ingress.routing_key.clone(),
            ingress.initial_step,
        );
        for payload in payloads {
            match ingress.submit(payload).await {
                Ok(id) => {
                    println!("submitted {id}");
                    submitted.push(id);
                }
                Err(err) => {
                    stop(handle).await?;
                    return Err(err).context("Failed to submit document");
                }
            }
        }
    }

    // 5. Wait
    if until_done {
        tokio::select! {
            res = signal::shutdown_signal() => res.context("Failed to install signal handlers")?,
            _ = wait_for_results(results.as_ref(), &submitted) => {}
        }
    } else {
        signal::shutdown_signal()
            .await
            .context("Failed to install signal handlers")?;
    }

    stop(handle).await?;

    // 6. Report
    for id in &submitted {
        match results.get_by_id(id).await? {
            Some(envelope) => println!("{}", serde_json::to_string_pretty(&envelope)?),
            None => println!("{id}: not completed"),
        }
    }
    Ok(())
}

fn parse_payload(doc: &str) -> Result<Payload> {
    let value: Value =
        serde_json::from_str(doc).with_context(|| format!("--submit is not valid JSON: {doc}"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("--submit must be a JSON object, got: {other}"),
    }
}

async fn wait_for_results(store: &dyn ResultStore, ids: &[EnvelopeId]) {
    let mut pending: Vec<&EnvelopeId> = ids.iter().collect();
    while !pending.is_empty() {
        let mut still_pending = Vec::with_capacity(pending.len());
        for id in pending {
            if !matches!(store.get_by_id(id).await, Ok(Some(_))) {
                still_pending.push(id);
            }
        }
        pending = still_pending;
        if !pending.is_empty() {
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }
    tracing::info!(completed = ids.len(), "All submitted documents completed");
}

async fn stop(handle: PipelineHandle) -> Result<()> {
    tracing::info!("Shutting down, draining in-flight deliveries");
    handle.shutdown_and_join().await?;
    Ok(())
}
