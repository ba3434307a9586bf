//! Domain identifiers (strongly-typed string IDs).
//!
//! Envelope ids are opaque on the wire: whatever the ingress assigned is carried
//! unchanged to the terminal stage. Locally generated ids are ULIDs (see
//! `ports::id_generator`), but nothing downstream relies on that shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation key of one unit of work, stable across every stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a stage. Written into `Envelope::source` when the stage forwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = EnvelopeId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");

        let back: EnvelopeId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);

        let stage = StageId::new("service1");
        assert_eq!(serde_json::to_string(&stage).unwrap(), "\"service1\"");
    }

    #[test]
    fn display_is_the_raw_value() {
        assert_eq!(EnvelopeId::from("01HZX").to_string(), "01HZX");
        assert_eq!(StageId::from("service2").to_string(), "service2");
    }
}
