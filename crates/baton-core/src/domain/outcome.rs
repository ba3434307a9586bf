//! Outcome model: how a consumer settles one delivery with the broker.
//!
//! Every delivery ends in exactly one of these.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    /// Acknowledge; the message leaves the queue.
    Ack,

    /// Negative-acknowledge and requeue for redelivery.
    RetryRequeue,

    /// Negative-acknowledge without requeue. The message never comes back.
    DiscardPoison,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StageOutcome::Ack => "ack",
            StageOutcome::RetryRequeue => "retry_requeue",
            StageOutcome::DiscardPoison => "discard_poison",
        }
    }

    /// Whether the broker should hand the message out again.
    pub fn requeues(self) -> bool {
        matches!(self, StageOutcome::RetryRequeue)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_as_screaming_snake_case() {
        assert_eq!(serde_json::to_string(&StageOutcome::Ack).unwrap(), "\"ACK\"");
        assert_eq!(
            serde_json::to_string(&StageOutcome::RetryRequeue).unwrap(),
            "\"RETRY_REQUEUE\""
        );
        assert_eq!(
            serde_json::to_string(&StageOutcome::DiscardPoison).unwrap(),
            "\"DISCARD_POISON\""
        );
    }

    #[test]
    fn only_retry_requeues() {
        assert!(StageOutcome::RetryRequeue.requeues());
        assert!(!StageOutcome::Ack.requeues());
        assert!(!StageOutcome::DiscardPoison.requeues());
    }
}
