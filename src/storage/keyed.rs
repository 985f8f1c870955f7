//! KeyedSerializer - per-resource mutual exclusion for read-modify-write
//!
//! Critical sections submitted for the same key run one at a time, in
//! arrival order (tokio's Mutex is FIFO-fair, so each key's mutex is its
//! queue). Different keys never wait on each other. A key's entry is removed
//! from the map as soon as its last pending section settles, whether it
//! returned, failed, panicked or was cancelled while waiting.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

struct Queue {
    lock: Arc<Mutex<()>>,
    /// Sections holding or waiting for `lock`. Only changed under the
    /// DashMap shard lock, so it is exact.
    pending: usize,
}

/// Serializes async critical sections by key (cheap to clone)
pub struct KeyedSerializer<K = String>
where
    K: Eq + Hash + Clone,
{
    queues: Arc<DashMap<K, Queue>>,
}

impl<K> KeyedSerializer<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Run `critical` once every earlier section for `key` has settled.
    pub async fn run<F, Fut, T>(&self, key: K, critical: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.enqueue(key);
        let _guard = slot.lock.lock().await;
        critical().await
    }

    fn enqueue(&self, key: K) -> Slot<'_, K> {
        // Entry API: get-or-insert and count under one shard lock
        let lock = {
            let mut queue = self.queues.entry(key.clone()).or_insert_with(|| Queue {
                lock: Arc::new(Mutex::new(())),
                pending: 0,
            });
            queue.pending += 1;
            Arc::clone(&queue.lock)
        };
        Slot {
            queues: &self.queues,
            key,
            lock,
        }
    }

    /// Keys with at least one running or waiting section
    pub fn active_keys(&self) -> usize {
        self.queues.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queues.is_empty()
    }
}

impl<K> Default for KeyedSerializer<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for KeyedSerializer<K>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
        }
    }
}

/// A place in a key's queue; leaving it drops the entry once drained
struct Slot<'a, K>
where
    K: Eq + Hash + Clone,
{
    queues: &'a DashMap<K, Queue>,
    key: K,
    lock: Arc<Mutex<()>>,
}

impl<K> Drop for Slot<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.queues.entry(self.key.clone()) {
            entry.get_mut().pending -= 1;
            if entry.get().pending == 0 {
                entry.remove();
            }
        }
    }
}
