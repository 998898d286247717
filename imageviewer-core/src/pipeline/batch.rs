//! Per-collection message batching.
//!
//! A lock-free map keys one open batch per collection; each batch guards its
//! message list with its own mutex so the map is never locked across work.
//! A batch leaves the map the moment it is claimed for processing, so late
//! arrivals open a fresh batch instead of racing the one in flight.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use imageviewer_model::CollectionId;

#[derive(Debug)]
struct CollectionBatch<M> {
    messages: Mutex<Vec<M>>,
    last_added: Mutex<Instant>,
    /// Set once the batch is claimed; adds that lose the race re-enter the
    /// map instead of appending to a batch nobody will process.
    closed: AtomicBool,
}

impl<M> CollectionBatch<M> {
    fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            last_added: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }
}

#[derive(Debug)]
pub struct BatchQueue<M> {
    batches: DashMap<CollectionId, Arc<CollectionBatch<M>>>,
    max_batch_size: usize,
    timeout: Duration,
}

impl<M> BatchQueue<M> {
    pub fn new(max_batch_size: usize, timeout: Duration) -> Self {
        Self {
            batches: DashMap::new(),
            max_batch_size: max_batch_size.max(1),
            timeout,
        }
    }

    /// Append a message to the collection's open batch. Returns the whole
    /// batch when this message filled it; the caller processes it.
    pub fn add(&self, collection_id: CollectionId, message: M) -> Option<Vec<M>> {
        loop {
            let batch = {
                let entry = self
                    .batches
                    .entry(collection_id)
                    .or_insert_with(|| Arc::new(CollectionBatch::new()));
                Arc::clone(&entry)
            };

            let mut messages = batch.messages.lock().expect("batch lock poisoned");
            if batch.closed.load(Ordering::Acquire) {
                // Claimed between our map lookup and lock; try again on a
                // fresh batch.
                drop(messages);
                continue;
            }
            messages.push(message);
            *batch.last_added.lock().expect("batch lock poisoned") = Instant::now();

            if messages.len() >= self.max_batch_size {
                batch.closed.store(true, Ordering::Release);
                let taken = mem::take(&mut *messages);
                drop(messages);
                self.batches
                    .remove_if(&collection_id, |_, existing| Arc::ptr_eq(existing, &batch));
                return Some(taken);
            }
            return None;
        }
    }

    /// Claim every batch whose last addition is older than the timeout.
    pub fn take_expired(&self) -> Vec<(CollectionId, Vec<M>)> {
        let now = Instant::now();
        let candidates: Vec<CollectionId> = self
            .batches
            .iter()
            .filter(|entry| {
                now.duration_since(*entry.value().last_added.lock().expect("batch lock poisoned"))
                    >= self.timeout
            })
            .map(|entry| *entry.key())
            .collect();

        candidates
            .into_iter()
            .filter_map(|collection_id| {
                self.claim(collection_id)
                    .map(|messages| (collection_id, messages))
            })
            .collect()
    }

    /// Claim everything, regardless of age. Used by the shutdown drain.
    pub fn drain_all(&self) -> Vec<(CollectionId, Vec<M>)> {
        let ids: Vec<CollectionId> = self.batches.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|collection_id| {
                self.claim(collection_id)
                    .map(|messages| (collection_id, messages))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn claim(&self, collection_id: CollectionId) -> Option<Vec<M>> {
        let batch = {
            let entry = self.batches.get(&collection_id)?;
            Arc::clone(entry.value())
        };
        let mut messages = batch.messages.lock().expect("batch lock poisoned");
        if batch.closed.load(Ordering::Acquire) || messages.is_empty() {
            return None;
        }
        batch.closed.store(true, Ordering::Release);
        let taken = mem::take(&mut *messages);
        drop(messages);
        self.batches
            .remove_if(&collection_id, |_, existing| Arc::ptr_eq(existing, &batch));
        Some(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fills_trigger_at_max_batch_size() {
        let queue = BatchQueue::new(3, Duration::from_secs(5));
        let collection_id = CollectionId::new();
        assert!(queue.add(collection_id, 1).is_none());
        assert!(queue.add(collection_id, 2).is_none());
        let batch = queue.add(collection_id, 3).expect("third add fills the batch");
        assert_eq!(batch, vec![1, 2, 3]);
        assert!(queue.is_empty());

        // The next message starts a fresh batch.
        assert!(queue.add(collection_id, 4).is_none());
    }

    #[tokio::test]
    async fn batches_are_grouped_by_collection() {
        let queue = BatchQueue::new(2, Duration::from_secs(5));
        let first = CollectionId::new();
        let second = CollectionId::new();
        assert!(queue.add(first, "a1").is_none());
        assert!(queue.add(second, "b1").is_none());
        assert_eq!(queue.add(first, "a2").unwrap(), vec!["a1", "a2"]);
        assert_eq!(queue.add(second, "b2").unwrap(), vec!["b1", "b2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_batches_are_claimed_by_age() {
        let queue = BatchQueue::new(100, Duration::from_secs(5));
        let stale = CollectionId::new();
        let fresh = CollectionId::new();
        queue.add(stale, "old");

        tokio::time::sleep(Duration::from_secs(6)).await;
        queue.add(fresh, "new");

        let expired = queue.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, stale);
        assert_eq!(expired[0].1, vec!["old"]);
        assert!(!queue.is_empty());
    }

    #[tokio::test]
    async fn drain_claims_everything() {
        let queue = BatchQueue::new(100, Duration::from_secs(5));
        queue.add(CollectionId::new(), 1);
        queue.add(CollectionId::new(), 2);
        let drained = queue.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
