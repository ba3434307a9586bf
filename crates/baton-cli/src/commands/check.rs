use std::path::Path;

use anyhow::{Context, Result};

use baton_core::impls;

/// Execute the `check` command: validate the pipeline and declare its topology.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse + validate the chain
    let (config, spec) = super::load(pipeline_path)?;
    println!("Pipeline structure: OK");

    // 2. Every stage has a known processor
    let pipeline = super::builder(&config, spec)?.build()?;
    println!("Processors:         OK");

    // 3. Broker reachable, topology declarable
    let broker = impls::connect(&config.broker.url)
        .with_context(|| format!("Failed to connect to broker: {}", config.broker.url))?;
    pipeline.spec().declare_topology(broker.as_ref()).await?;
    println!("Broker topology:    OK");

    for stage in &pipeline.spec().stages {
        let output = match &stage.output {
            Some(out) => format!("{} [{}]", out.exchange, out.routing_keys.join(", ")),
            None => "(terminal)".to_string(),
        };
        println!(
            "  {:12} step {} : {}/{} -> {}  x{}",
            stage.id,
            stage.input.expected_step,
            stage.input.exchange,
            stage.input.routing_key,
            output,
            stage.instances
        );
    }

    println!("\nAll checks passed.");
    Ok(())
}
