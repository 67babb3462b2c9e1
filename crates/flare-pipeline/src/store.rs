//! Offline persistence seam
//!
//! The pipeline does not store payloads itself. When a store is configured,
//! payloads that could not reach the collector are handed to it, and a
//! destination's pending payloads are loaded back when its queue is created.

use crate::error::Result;
use async_trait::async_trait;
use flare_core::{Destination, Payload};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn save_undelivered(&self, payload: &Payload) -> Result<()>;

    /// Pending payloads for `destination`, oldest first. Returned payloads
    /// are owned by the caller from then on.
    async fn load_pending(&self, destination: &Destination) -> Result<Vec<Payload>>;
}

/// Process-local store, mostly useful for tests and for carrying payloads
/// across controller restarts inside one process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    payloads: Mutex<HashMap<Destination, Vec<Payload>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PayloadStore for InMemoryStore {
    async fn save_undelivered(&self, payload: &Payload) -> Result<()> {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(payload.destination())
            .or_default()
            .push(payload.clone());
        Ok(())
    }

    async fn load_pending(&self, destination: &Destination) -> Result<Vec<Payload>> {
        Ok(self
            .payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(destination)
            .unwrap_or_default())
    }
}
