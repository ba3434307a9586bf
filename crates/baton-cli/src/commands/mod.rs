pub mod check;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};

use baton_core::app::{PipelineBuilder, PipelineSpec};
use baton_core::config::{self, PipelineConfig};

use crate::processors;

/// Parse and validate a pipeline file.
fn load(pipeline_path: &Path) -> Result<(PipelineConfig, PipelineSpec)> {
    let config = config::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let spec = config.validate()?;
    Ok((config, spec))
}

/// Attach the configured processor to every stage.
fn builder(config: &PipelineConfig, spec: PipelineSpec) -> Result<PipelineBuilder> {
    let mut builder = PipelineBuilder::new(spec);
    for (stage, name) in config.processors() {
        let processor = processors::resolve(name, stage.clone())?;
        builder = builder.shared_processor(stage, processor)?;
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn bundled(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("pipelines")
            .join(name)
    }

    #[test]
    fn bundled_pipeline_loads_and_builds() {
        let (config, spec) = load(&bundled("three-services.yaml")).unwrap();
        assert_eq!(spec.stages.len(), 3);
        assert!(config.ingress.is_some());
        let pipeline = builder(&config, spec).unwrap().build().unwrap();
        assert!(pipeline.spec().stages[2].is_terminal());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load(Path::new("/nonexistent/pipeline.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/pipeline.yaml"));
    }
}
