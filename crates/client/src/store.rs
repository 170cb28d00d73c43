//! Expiring, retry-counted action message store.
//!
//! One background sweeper task reaps due entries from a min-heap of
//! expiries; a single mutex guards both the map and the heap, so an expiry
//! sweep and an explicit removal or retrieval can never race.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::StoreError;
use gw_protocol::epoch_ms;

/// Times a stored message may be re-read via [`ActionStore::retry_get`]
/// before it is discarded.
pub const DEFAULT_RETRIES: u32 = 4;

struct Entry<T> {
    value: T,
    expires_at: i64,
    retries: u32,
}

struct Inner<T> {
    map: HashMap<String, Entry<T>>,
    /// Min-heap of `(expires_at, id)`. Entries removed from the map leave
    /// stale heap nodes behind; the sweeper skips them.
    deadlines: BinaryHeap<Reverse<(i64, String)>>,
}

/// Thread-safe key-value store whose entries expire at an absolute epoch-ms
/// deadline and carry a retry budget.
///
/// Must be created inside a Tokio runtime (it spawns its sweeper task).
/// Dropping the store aborts the sweeper.
pub struct ActionStore<T> {
    /// Wire name of the stored message kind, for log output.
    label: &'static str,
    inner: Arc<Mutex<Inner<T>>>,
    wake: Arc<Notify>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl<T: Clone + Send + 'static> ActionStore<T> {
    pub fn new(label: &'static str) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            map: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }));
        let wake = Arc::new(Notify::new());
        let sweeper = tokio::spawn(sweep(label, Arc::clone(&inner), Arc::clone(&wake)));

        Self {
            label,
            inner,
            wake,
            sweeper,
        }
    }

    /// Insert `value` under `id` with the default retry budget.
    ///
    /// # Errors
    ///
    /// [`StoreError::Expired`] when `expires_at` is already past,
    /// [`StoreError::Exists`] when the id is already stored. The store is
    /// left unchanged in both cases.
    pub fn add(&self, id: &str, expires_at: i64, value: T) -> Result<(), StoreError> {
        self.add_with_retries(id, expires_at, value, DEFAULT_RETRIES)
    }

    /// Insert with an explicit retry budget.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn add_with_retries(
        &self,
        id: &str,
        expires_at: i64,
        value: T,
        retries: u32,
    ) -> Result<(), StoreError> {
        if expires_at < epoch_ms() {
            return Err(StoreError::Expired {
                id: id.to_owned(),
                kind: self.label,
            });
        }

        {
            let mut inner = self.inner.lock();
            if inner.map.contains_key(id) {
                return Err(StoreError::Exists {
                    id: id.to_owned(),
                    kind: self.label,
                });
            }
            inner.map.insert(
                id.to_owned(),
                Entry {
                    value,
                    expires_at,
                    retries,
                },
            );
            inner.deadlines.push(Reverse((expires_at, id.to_owned())));
        }

        // The new deadline may be earlier than what the sweeper sleeps on.
        self.wake.notify_one();
        Ok(())
    }

    /// The stored value, or `None` when absent or expired. Never touches
    /// the retry counter.
    pub fn get(&self, id: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        self.reap_if_expired(&mut inner, id);
        inner.map.get(id).map(|entry| entry.value.clone())
    }

    /// Like [`get`](Self::get), but each call spends one retry. When the
    /// budget hits zero the entry is removed instead and `None` is returned,
    /// capping how often a nack-triggered redelivery can be attempted.
    pub fn retry_get(&self, id: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        self.reap_if_expired(&mut inner, id);

        let entry = inner.map.get_mut(id)?;
        if entry.retries == 0 {
            tracing::info!(id, kind = self.label, "discarding message, no retries left");
            inner.map.remove(id);
            return None;
        }
        entry.retries -= 1;
        Some(entry.value.clone())
    }

    /// Remove an entry. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) {
        self.inner.lock().map.remove(id);
    }

    /// Drop all entries and pending expiries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Guard against the gap between a deadline passing and the sweeper
    /// waking up: a due entry must never be observable.
    fn reap_if_expired(&self, inner: &mut Inner<T>, id: &str) {
        if let Some(entry) = inner.map.get(id) {
            if entry.expires_at < epoch_ms() {
                tracing::info!(id, kind = self.label, "discarding expired message");
                inner.map.remove(id);
            }
        }
    }
}

impl<T> Drop for ActionStore<T> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Background sweeper: sleeps until the earliest deadline, then removes
/// every entry that is due. Woken early when an earlier deadline arrives.
async fn sweep<T>(label: &'static str, inner: Arc<Mutex<Inner<T>>>, wake: Arc<Notify>) {
    loop {
        let next_deadline = {
            let mut guard = inner.lock();
            next_live_deadline(&mut guard)
        };

        match next_deadline {
            None => wake.notified().await,
            Some(deadline) => {
                let wait_ms = (deadline - epoch_ms()).max(0) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(wait_ms)) => {
                        reap_due(label, &inner);
                    }
                    _ = wake.notified() => {}
                }
            }
        }
    }
}

/// Earliest deadline that still maps to a live entry, discarding stale heap
/// nodes along the way.
fn next_live_deadline<T>(inner: &mut Inner<T>) -> Option<i64> {
    while let Some(Reverse((deadline, id))) = inner.deadlines.peek().cloned() {
        match inner.map.get(&id) {
            Some(entry) if entry.expires_at == deadline => return Some(deadline),
            _ => {
                inner.deadlines.pop();
            }
        }
    }
    None
}

fn reap_due<T>(label: &'static str, inner: &Mutex<Inner<T>>) {
    let now = epoch_ms();
    let mut guard = inner.lock();
    while let Some(Reverse((deadline, id))) = guard.deadlines.peek().cloned() {
        if deadline > now {
            break;
        }
        guard.deadlines.pop();
        match guard.map.get(&id) {
            Some(entry) if entry.expires_at == deadline => {
                tracing::info!(id, kind = label, "discarding expired message");
                guard.map.remove(&id);
            }
            _ => {} // stale heap node
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ActionStore<String> {
        ActionStore::new("submitAction")
    }

    #[tokio::test]
    async fn add_then_get_returns_the_value() {
        let store = store();
        store.add("a1", epoch_ms() + 60_000, "payload".into()).unwrap();
        assert_eq!(store.get("a1").as_deref(), Some("payload"));
        assert_eq!(store.get("missing"), None);
    }

    #[tokio::test]
    async fn add_in_the_past_fails_and_leaves_store_unchanged() {
        let store = store();
        let err = store.add("a1", epoch_ms() - 1_000, "x".into()).unwrap_err();
        assert!(matches!(err, StoreError::Expired { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_fails_and_keeps_the_original() {
        let store = store();
        store.add("a1", epoch_ms() + 60_000, "first".into()).unwrap();
        let err = store
            .add("a1", epoch_ms() + 120_000, "second".into())
            .unwrap_err();
        assert!(matches!(err, StoreError::Exists { .. }));
        assert_eq!(store.get("a1").as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn retry_get_exhausts_the_budget() {
        let store = store();
        store
            .add_with_retries("a1", epoch_ms() + 60_000, "v".into(), 4)
            .unwrap();

        for _ in 0..4 {
            assert_eq!(store.retry_get("a1").as_deref(), Some("v"));
        }
        // Fifth call: budget spent, entry removed.
        assert_eq!(store.retry_get("a1"), None);
        assert_eq!(store.get("a1"), None);
    }

    #[tokio::test]
    async fn get_does_not_spend_retries() {
        let store = store();
        store
            .add_with_retries("a1", epoch_ms() + 60_000, "v".into(), 1)
            .unwrap();
        for _ in 0..10 {
            assert!(store.get("a1").is_some());
        }
        assert_eq!(store.retry_get("a1").as_deref(), Some("v"));
        assert_eq!(store.retry_get("a1"), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = store();
        store.add("a1", epoch_ms() + 80, "v".into()).unwrap();
        assert!(store.get("a1").is_some());

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        // The sweeper reaps on its own; no get() needed to trigger it.
        assert!(store.is_empty(), "sweeper should have reaped the entry");
        assert_eq!(store.get("a1"), None);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_cancels_expiry() {
        let store = store();
        store.add("a1", epoch_ms() + 60_000, "v".into()).unwrap();
        store.remove("a1");
        store.remove("a1");
        assert_eq!(store.get("a1"), None);

        // The id can be reused after removal.
        store.add("a1", epoch_ms() + 60_000, "again".into()).unwrap();
        assert_eq!(store.get("a1").as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let store = store();
        for i in 0..5 {
            store
                .add(&format!("a{i}"), epoch_ms() + 60_000, "v".into())
                .unwrap();
        }
        assert_eq!(store.len(), 5);
        store.clear();
        assert!(store.is_empty());
    }
}
