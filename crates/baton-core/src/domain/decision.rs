//! Decision model: what to tell the broker about a delivery.
//!
//! Two pure pieces live here:
//! - `ErrorClassifier` turns a processor failure into Transient / Permanent.
//! - `RedeliveryPolicy` caps how many times a message may be requeued.
//!
//! Neither has side effects. The worker executes the resulting `Decision`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, StageError};
use super::outcome::StageOutcome;

/// Why a message is being thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardKind {
    /// Malformed, or failed permanently.
    Poison,
    /// Was retryable, but ran out of deliveries.
    Exhausted,
}

/// The next action for one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ack,
    Requeue { reason: String },
    Discard { kind: DiscardKind, reason: String },
}

impl Decision {
    pub fn requeue(reason: impl Into<String>) -> Self {
        Decision::Requeue {
            reason: reason.into(),
        }
    }

    pub fn poison(reason: impl Into<String>) -> Self {
        Decision::Discard {
            kind: DiscardKind::Poison,
            reason: reason.into(),
        }
    }

    pub fn outcome(&self) -> StageOutcome {
        match self {
            Decision::Ack => StageOutcome::Ack,
            Decision::Requeue { .. } => StageOutcome::RetryRequeue,
            Decision::Discard { .. } => StageOutcome::DiscardPoison,
        }
    }
}

/// Classifies processor failures for one stage.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &StageError) -> ErrorKind;
}

/// Explicit per-stage table: condition -> kind.
///
/// Anything not listed falls back to `unclassified`, which is Permanent unless the
/// stage opts into something else.
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    rules: HashMap<String, ErrorKind>,
    unclassified: ErrorKind,
}

impl ClassificationTable {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            unclassified: ErrorKind::Permanent,
        }
    }

    pub fn transient(self, condition: impl Into<String>) -> Self {
        self.rule(condition, ErrorKind::Transient)
    }

    pub fn permanent(self, condition: impl Into<String>) -> Self {
        self.rule(condition, ErrorKind::Permanent)
    }

    pub fn rule(mut self, condition: impl Into<String>, kind: ErrorKind) -> Self {
        self.rules.insert(condition.into(), kind);
        self
    }

    pub fn with_unclassified(mut self, kind: ErrorKind) -> Self {
        self.unclassified = kind;
        self
    }

    pub fn kind_of(&self, condition: &str) -> Option<ErrorKind> {
        self.rules.get(condition).copied()
    }

    pub fn unclassified(&self) -> ErrorKind {
        self.unclassified
    }
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for ClassificationTable {
    fn classify(&self, error: &StageError) -> ErrorKind {
        match self.kind_of(error.condition()) {
            Some(kind) => kind,
            None => {
                tracing::warn!(
                    condition = error.condition(),
                    fallback = ?self.unclassified,
                    "unclassified stage error condition"
                );
                self.unclassified
            }
        }
    }
}

/// Caps redeliveries. `delivery_count` is 1 on the first delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedeliveryPolicy {
    max_deliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_deliveries: None,
        }
    }

    pub fn at_most(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries),
        }
    }

    pub fn max_deliveries(&self) -> Option<u32> {
        self.max_deliveries
    }

    /// Turn a requeue into an `Exhausted` discard once the limit is reached.
    pub fn apply(&self, delivery_count: u32, decision: Decision) -> Decision {
        match (decision, self.max_deliveries) {
            (Decision::Requeue { reason }, Some(max)) if delivery_count >= max => {
                Decision::Discard {
                    kind: DiscardKind::Exhausted,
                    reason: format!("delivery {delivery_count}/{max} exhausted: {reason}"),
                }
            }
            (decision, _) => decision,
        }
    }
}
