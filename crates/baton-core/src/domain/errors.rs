//! Errors - processing failures and their classification.

use std::fmt;

/// Operational class of a processing failure.
///
/// - Transient: may succeed on redelivery (requeue)
/// - Permanent: will fail again no matter how often it is retried (discard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// A domain failure reported by a stage processor.
///
/// `condition` names the failure (e.g. `downstream_busy`, `invalid_amount`). It is
/// the key the stage's classification table is looked up with; the processor does
/// not decide retry vs. discard itself.
#[derive(Debug)]
pub struct StageError {
    condition: String,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StageError {
    pub fn new(condition: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.condition, self.message)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_includes_condition_and_message() {
        let err = StageError::new("downstream_busy", "inventory service returned 503");
        assert_eq!(err.to_string(), "downstream_busy: inventory service returned 503");
        assert_eq!(err.condition(), "downstream_busy");
        assert!(err.source().is_none());
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::other("socket closed");
        let err = StageError::new("io", "lookup failed").with_source(io);
        assert_eq!(err.source().unwrap().to_string(), "socket closed");
    }
}
