//! ResultStore port - narrow storage capability for finished work.
//!
//! Two operations only: `create` and `get_by_id`. Implementations must be safe to
//! call from several workers at once; `create` is atomic per id.

use async_trait::async_trait;

use crate::domain::{Envelope, EnvelopeId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    AlreadyExists(EnvelopeId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, envelope: Envelope) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError>;
}
