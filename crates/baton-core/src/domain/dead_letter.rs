//! DeadLetter - what gets recorded when a stage gives up on a message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::DiscardKind;
use super::ids::{EnvelopeId, StageId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub stage: StageId,
    pub kind: DiscardKind,
    pub reason: String,

    /// Present when the id could be recovered from the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<EnvelopeId>,

    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,

    /// Original body, lossily decoded as UTF-8.
    pub body: String,
}

impl DeadLetter {
    pub fn new(
        stage: StageId,
        kind: DiscardKind,
        reason: impl Into<String>,
        body: &[u8],
        delivery_count: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage,
            kind,
            reason: reason.into(),
            envelope_id: super::Envelope::peek_id(body),
            delivery_count,
            failed_at,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}
