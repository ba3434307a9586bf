//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{ConfigError, PipelineConfig};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns `ConfigError::MissingEnv` naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = ENV_VAR_RE
        .captures_iter(input)
        .map(|cap| cap[1].to_string())
        .filter(|name| std::env::var(name).is_err())
        .collect();

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(ConfigError::MissingEnv(missing));
    }

    let replaced = ENV_VAR_RE.replace_all(input, |cap: &Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    });
    Ok(replaced.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig, ConfigError> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig = serde_yaml::from_str(&substituted)?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        unsafe { std::env::set_var("BATON_TEST_HOST", "broker.internal") };
        let input = "url: memory://${BATON_TEST_HOST}\nqueue: q";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url: memory://broker.internal\nqueue: q");
        unsafe { std::env::remove_var("BATON_TEST_HOST") };
    }

    #[test]
    fn test_repeated_env_var() {
        unsafe { std::env::set_var("BATON_TEST_EX", "orders") };
        let input = "${BATON_TEST_EX}_exchange / ${BATON_TEST_EX}_queue";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "orders_exchange / orders_queue");
        unsafe { std::env::remove_var("BATON_TEST_EX") };
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "exchange: service1_exchange\nstep: 0";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_missing_env_vars_all_reported() {
        let input = "${BATON_MISSING_X} and ${BATON_MISSING_Y}";
        let err = substitute_env_vars(input).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("BATON_MISSING_X"));
        assert!(msg.contains("BATON_MISSING_Y"));
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        assert!(matches!(parse_pipeline_str(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let err = parse_pipeline(Path::new("/nonexistent/pipeline.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pipeline.yaml"));
    }
}
