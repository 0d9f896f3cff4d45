//! In-memory publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{BusError, Delivery, Publisher};

/// A publication captured by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub delivery: Delivery,
    pub retain: bool,
}

/// Publisher that records every message instead of sending it.
pub struct MemoryPublisher {
    publications: Mutex<Vec<Publication>>,

    /// Number of recorded publications, for tests that wait on progress.
    count: watch::Sender<usize>,

    /// When set, every publish fails.
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self {
            publications: Mutex::new(Vec::new()),
            count: watch::Sender::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All recorded publications, oldest first.
    pub fn publications(&self) -> Vec<Publication> {
        self.lock().clone()
    }

    /// Recorded payloads, oldest first.
    pub fn payloads(&self) -> Vec<String> {
        self.lock().iter().map(|p| p.payload.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `count` publications have been recorded.
    pub async fn wait_for_count(&self, count: usize) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so this only resolves on the predicate.
        let _ = rx.wait_for(|recorded| *recorded >= count).await;
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Publication>> {
        self.publications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        delivery: Delivery,
        retain: bool,
    ) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Publish("memory publisher set to fail".to_string()));
        }

        debug!(topic = %topic, payload = %payload, "[MEMORY] Publishing");

        let recorded = {
            let mut publications = self.lock();
            publications.push(Publication {
                topic: topic.to_string(),
                payload: payload.to_string(),
                delivery,
                retain,
            });
            publications.len()
        };
        self.count.send_replace(recorded);

        Ok(())
    }
}
