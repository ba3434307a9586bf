//! Built-in processors, selected by name in the pipeline YAML.
//!
//! - `annotate`: marks the envelope as handled by this stage
//!   (`<stage>_processed`, `<stage>_timestamp`)
//! - `finalize`: same, plus a `final_result` summary for terminal stages
//!
//! Both only overwrite their own keys, so running them twice on the same input
//! gives the same document apart from the timestamp.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

use baton_core::app::StageProcessor;
use baton_core::domain::{Envelope, StageError, StageId};
use baton_core::ports::{Clock, SystemClock};

pub const FINAL_RESULT: &str = "Processing completed successfully";

pub struct Annotate {
    stage: StageId,
    final_result: Option<&'static str>,
    clock: Arc<dyn Clock>,
}

impl Annotate {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            final_result: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn finalize(stage: StageId) -> Self {
        Self {
            final_result: Some(FINAL_RESULT),
            ..Self::new(stage)
        }
    }
}

#[async_trait]
impl StageProcessor for Annotate {
    async fn process(&self, mut envelope: Envelope) -> Result<Envelope, StageError> {
        envelope.insert(format!("{}_processed", self.stage), true);
        envelope.insert(
            format!("{}_timestamp", self.stage),
            self.clock.now().to_rfc3339(),
        );
        if let Some(result) = self.final_result {
            envelope.insert("final_result", result);
        }
        Ok(envelope)
    }
}

/// Look up a processor by its configured name.
pub fn resolve(name: &str, stage: StageId) -> Result<Arc<dyn StageProcessor>> {
    match name {
        "annotate" => Ok(Arc::new(Annotate::new(stage))),
        "finalize" => Ok(Arc::new(Annotate::finalize(stage))),
        other => bail!("unknown processor `{other}` for stage {stage}"),
    }
}
