//! Domain model (ids, envelope, outcomes, decisions, errors).

pub mod dead_letter;
pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;

pub use dead_letter::DeadLetter;
pub use decision::{ClassificationTable, Decision, DiscardKind, ErrorClassifier, RedeliveryPolicy};
pub use envelope::{Envelope, EnvelopeError, Payload};
pub use errors::{ErrorKind, StageError};
pub use ids::{EnvelopeId, StageId};
pub use outcome::StageOutcome;
