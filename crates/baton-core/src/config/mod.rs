//! Config - pipeline の YAML 定義
//!
//! Loaded once at startup and never reloaded. `PipelineConfig::to_spec` turns the
//! document into a `PipelineSpec`; `validate` adds the checks that only make sense
//! for a whole deployment (ingress entry point, redelivery limits).
//!
//! Processors are referenced by name (`processor: annotate`). Resolving the name to
//! code is left to the binary.

pub mod parser;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::app::{InputBinding, OutputBinding, PipelineError, PipelineSpec, StageSpec};
use crate::domain::{ClassificationTable, ErrorKind, RedeliveryPolicy, StageId};

pub use self::parser::{parse_pipeline, parse_pipeline_str, substitute_env_vars};

pub const DEFAULT_BROKER_URL: &str = "memory://local";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read pipeline file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing environment variable(s): {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pipeline: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("stage {stage}: {reason}")]
    Stage { stage: StageId, reason: String },

    #[error("ingress: {0}")]
    Ingress(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterConfig>,
    #[serde(default)]
    pub ingress: Option<IngressConfig>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    pub exchange: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub initial_step: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub id: String,
    /// Name of the processor implementation.
    pub processor: String,
    pub input: InputConfig,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default)]
    pub max_deliveries: Option<u32>,
    /// condition -> transient | permanent
    #[serde(default)]
    pub errors: BTreeMap<String, ErrorKind>,
    #[serde(default = "default_unclassified")]
    pub unclassified: ErrorKind,
}

fn default_instances() -> usize {
    1
}

fn default_unclassified() -> ErrorKind {
    ErrorKind::Permanent
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub expected_step: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

impl StageConfig {
    pub fn to_spec(&self) -> StageSpec {
        let input = InputBinding::new(
            self.input.exchange.clone(),
            self.input.queue.clone(),
            self.input.routing_key.clone(),
            self.input.expected_step,
        );

        let classification = self
            .errors
            .iter()
            .fold(ClassificationTable::new(), |table, (condition, kind)| {
                table.rule(condition.clone(), *kind)
            })
            .with_unclassified(self.unclassified);

        let redelivery = match self.max_deliveries {
            Some(max) => RedeliveryPolicy::at_most(max),
            None => RedeliveryPolicy::unlimited(),
        };

        let mut spec = StageSpec::new(self.id.clone(), input)
            .instances(self.instances)
            .classify(classification)
            .redelivery(redelivery);
        if let Some(output) = &self.output {
            spec = spec.forward_to(OutputBinding {
                exchange: output.exchange.clone(),
                routing_keys: output.routing_keys.clone(),
            });
        }
        spec
    }
}

impl PipelineConfig {
    pub fn to_spec(&self) -> PipelineSpec {
        PipelineSpec {
            stages: self.stages.iter().map(StageConfig::to_spec).collect(),
            dead_letter_exchange: self.dead_letter.as_ref().map(|d| d.exchange.clone()),
        }
    }

    /// Validate the document and return the pipeline it describes.
    pub fn validate(&self) -> Result<PipelineSpec, ConfigError> {
        for stage in &self.stages {
            if stage.processor.trim().is_empty() {
                return Err(ConfigError::Stage {
                    stage: StageId::new(stage.id.clone()),
                    reason: "processor must not be empty".to_string(),
                });
            }
            if stage.max_deliveries == Some(0) {
                return Err(ConfigError::Stage {
                    stage: StageId::new(stage.id.clone()),
                    reason: "max_deliveries must be at least 1".to_string(),
                });
            }
        }

        if let Some(dl) = &self.dead_letter
            && dl.exchange.is_empty()
        {
            return Err(ConfigError::Pipeline(PipelineError::EmptyName {
                stage: StageId::new("dead_letter"),
                field: "exchange",
            }));
        }

        let spec = self.to_spec();
        spec.validate()?;

        if let Some(ingress) = &self.ingress {
            let mut entry = spec
                .consumers_of(&ingress.exchange, &ingress.routing_key)
                .peekable();
            if entry.peek().is_none() {
                return Err(ConfigError::Ingress(format!(
                    "{}/{} is not consumed by any stage",
                    ingress.exchange, ingress.routing_key
                )));
            }
            if let Some(stage) = entry.find(|s| s.input.expected_step != ingress.initial_step) {
                return Err(ConfigError::Ingress(format!(
                    "stage {} expects step {}, ingress sends step {}",
                    stage.id, stage.input.expected_step, ingress.initial_step
                )));
            }
        }

        Ok(spec)
    }

    /// Processor name for each stage, in declaration order.
    pub fn processors(&self) -> impl Iterator<Item = (StageId, &str)> + '_ {
        self.stages
            .iter()
            .map(|s| (StageId::new(s.id.clone()), s.processor.as_str()))
    }
}
