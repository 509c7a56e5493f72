//! Registry of in-flight refresh batches, for cooperative cancellation.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tracks the cancellation token of every running batch.
#[derive(Default)]
pub struct BatchRegistry {
    batches: DashMap<Uuid, CancellationToken>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch under `id`, or a fresh ID when none is given.
    ///
    /// Re-using the ID of a running batch cancels the older one.
    pub fn begin(&self, id: Option<Uuid>) -> Batch<'_> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let token = CancellationToken::new();
        if let Some(old) = self.batches.insert(id, token.clone()) {
            tracing::warn!("Batch {} restarted, cancelling previous run", id);
            old.cancel();
        }
        tracing::debug!("Batch {} started", id);

        Batch {
            registry: self,
            id,
            token,
        }
    }

    /// Cancel a running batch. Returns false if it is unknown or finished.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.batches.get(id) {
            Some(token) => {
                token.cancel();
                tracing::info!("Batch {} cancelled", id);
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> usize {
        self.batches.len()
    }
}

/// A registered batch. Dropping it deregisters and cancels the batch.
pub struct Batch<'a> {
    registry: &'a BatchRegistry,
    pub id: Uuid,
    pub token: CancellationToken,
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        // Only remove our own token, a restart may have replaced it
        self.registry
            .batches
            .remove_if(&self.id, |_, t| t.is_cancelled());
    }
}
