//! Envelope - the unit of work carried between stages.
//!
//! Wire shape (JSON):
//!
//! ```text
//! {"id": "...", "data": {...}, "timestamp": "<RFC3339>", "source": "...", "step": 0}
//! ```
//!
//! `payload` / `created_at` are accepted as input aliases for `data` / `timestamp`.
//! Top-level fields this crate does not know about are kept in `extra` and written
//! back out unchanged, so producers that add metadata are not silently truncated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::ids::{EnvelopeId, StageId};

/// Open document carried by an envelope. Stages add keys; they never remove them.
pub type Payload = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("envelope field `{0}` is missing or empty")]
    MissingField(&'static str),

    #[error("envelope step {0} cannot be advanced")]
    StepOverflow(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,

    #[serde(rename = "data", alias = "payload", default, deserialize_with = "null_as_empty")]
    payload: Payload,

    #[serde(rename = "timestamp", alias = "created_at")]
    created_at: DateTime<Utc>,

    source: String,

    step: u64,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Payload>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Envelope {
    /// Create a fresh envelope at the start of a chain.
    pub fn originate(
        id: EnvelopeId,
        payload: Payload,
        created_at: DateTime<Utc>,
        source: impl Into<String>,
        step: u64,
    ) -> Self {
        Self {
            id,
            payload,
            created_at,
            source: source.into(),
            step,
            extra: Map::new(),
        }
    }

    /// Decode and check the fields the pipeline itself depends on.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Best-effort id recovery from a body that failed to decode as an envelope.
    pub fn peek_id(bytes: &[u8]) -> Option<EnvelopeId> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(EnvelopeId::new)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        Ok(())
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Add or overwrite a payload key. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.payload.insert(key.into(), value.into())
    }

    pub fn extend<I, K>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (key, value) in entries {
            self.payload.insert(key.into(), value);
        }
    }

    /// Builder-style `insert`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Stamp the envelope as produced by `stage` and move it one hop forward.
    /// Leaves the envelope untouched if `step` is already at its maximum.
    pub fn advance(&mut self, stage: &StageId) -> Result<(), EnvelopeError> {
        let next = self
            .step
            .checked_add(1)
            .ok_or(EnvelopeError::StepOverflow(self.step))?;
        self.source = stage.as_str().to_string();
        self.step = next;
        Ok(())
    }

    /// Copy back unknown top-level fields of `before` that `self` no longer has.
    /// Fields `self` still carries keep their current value.
    pub fn restore_extra(&mut self, before: &Envelope) {
        for (key, value) in &before.extra {
            if !self.extra.contains_key(key) {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }

    /// Describe how `self` (a processor's output) breaks the additive contract
    /// relative to `before` (its input), or `None` if it does not.
    pub fn additive_violation(&self, before: &Envelope) -> Option<String> {
        if self.id != before.id {
            return Some(format!("id changed from {} to {}", before.id, self.id));
        }
        if self.created_at != before.created_at {
            return Some("created_at changed".to_string());
        }
        let dropped: Vec<&str> = before
            .payload
            .keys()
            .filter(|k| !self.payload.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if !dropped.is_empty() {
            return Some(format!("payload keys removed: {}", dropped.join(", ")));
        }
        None
    }
}
