//! InMemoryResultStore - mutex-guarded map behind the `ResultStore` port.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{Envelope, EnvelopeId};
use crate::ports::{ResultStore, StoreError};

#[derive(Default)]
pub struct InMemoryResultStore {
    records: Mutex<HashMap<EnvelopeId, Envelope>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn create(&self, envelope: Envelope) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("result store poisoned".to_string()))?;
        let id = envelope.id().clone();
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        records.insert(id, envelope);
        Ok(())
    }

    async fn get_by_id(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("result store poisoned".to_string()))?;
        Ok(records.get(id).cloned())
    }
}
