// src/core/coalescer/mod.rs

//! The Event Coalescer (spec §4.D): collapses bursts of per-key change
//! notifications into at most one callback invocation per key per tick.
//! Tick-loop shape grounded on `core/pubsub/channel_purger.rs`'s
//! `tokio::select! { interval.tick(), shutdown }` task pattern.
//!
//! The spec's single `enqueue(key, callback)` operation is split here into
//! two: `enqueue(key)` marks a key dirty (called by the Informer on every
//! cache mutation, which has no callback to offer) and `register_callback`
//! installs/replaces the callback a key's tick invokes (called once by the
//! SSE Hub when it first cares about a key). Externally this preserves the
//! exact guarantee spec §3/§8 require: each bucket's callback fires at most
//! once per tick regardless of how many times `enqueue` was called.

use crate::core::informer::InformerKey;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct Bucket {
    pending: bool,
    callback: Option<Callback>,
}

struct Inner {
    buckets: Mutex<IndexMap<InformerKey, Bucket>>,
    max_keys: usize,
}

impl Inner {
    fn ensure_capacity(&self, map: &mut IndexMap<InformerKey, Bucket>, key: &InformerKey) {
        if map.contains_key(key) || map.len() < self.max_keys {
            return;
        }
        if let Some((oldest, _)) = map.get_index(0).map(|(k, _)| (k.clone(), ())) {
            warn!(key = %oldest, "coalescer at capacity, dropping oldest pending notification");
            map.shift_remove(&oldest);
        }
    }
}

/// Cheaply cloneable front for the coalescer's background task.
#[derive(Clone)]
pub struct CoalescerHandle {
    inner: Arc<Inner>,
}

impl CoalescerHandle {
    pub fn enqueue(&self, key: InformerKey) {
        let mut map = self.inner.buckets.lock();
        self.inner.ensure_capacity(&mut map, &key);
        map.entry(key)
            .and_modify(|b| b.pending = true)
            .or_insert(Bucket {
                pending: true,
                callback: None,
            });
    }

    pub fn register_callback(&self, key: InformerKey, callback: Callback) {
        let mut map = self.inner.buckets.lock();
        self.inner.ensure_capacity(&mut map, &key);
        map.entry(key)
            .and_modify(|b| b.callback = Some(callback.clone()))
            .or_insert(Bucket {
                pending: false,
                callback: Some(callback),
            });
    }

    pub fn tracked_key_count(&self) -> usize {
        self.inner.buckets.lock().len()
    }

    fn flush(&self) -> usize {
        let due: Vec<Callback> = {
            let mut map = self.inner.buckets.lock();
            map.values_mut()
                .filter_map(|b| {
                    if b.pending {
                        b.pending = false;
                        b.callback.clone()
                    } else {
                        None
                    }
                })
                .collect()
        };
        let fired = due.len();
        for cb in due {
            cb();
        }
        fired
    }
}

pub struct Coalescer;

impl Coalescer {
    /// Spawns the 1 Hz (default) tick task and returns a handle to it.
    pub fn spawn(interval: Duration, max_keys: usize, cancel: CancellationToken) -> CoalescerHandle {
        let inner = Arc::new(Inner {
            buckets: Mutex::new(IndexMap::new()),
            max_keys,
        });
        let handle = CoalescerHandle { inner };

        let task_handle = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let fired = task_handle.flush();
                        debug!(fired, "coalescer shutting down, final flush complete");
                        break;
                    }
                    _ = ticker.tick() => {
                        task_handle.flush();
                    }
                }
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(n: &str) -> InformerKey {
        InformerKey::new("c", "cl", "", "v1", n)
    }

    #[test]
    fn multiple_enqueues_fire_callback_once_per_flush() {
        let inner = Arc::new(Inner {
            buckets: Mutex::new(IndexMap::new()),
            max_keys: 10,
        });
        let handle = CoalescerHandle { inner };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        handle.register_callback(key("pods"), Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..50 {
            handle.enqueue(key("pods"));
        }
        let fired = handle.flush();
        assert_eq!(fired, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Nothing pending now; a second flush fires nothing.
        assert_eq!(handle.flush(), 0);
    }

    #[test]
    fn capacity_eviction_drops_oldest() {
        let inner = Arc::new(Inner {
            buckets: Mutex::new(IndexMap::new()),
            max_keys: 2,
        });
        let handle = CoalescerHandle { inner };
        handle.enqueue(key("a"));
        handle.enqueue(key("b"));
        handle.enqueue(key("c"));
        assert_eq!(handle.tracked_key_count(), 2);
        let map = handle.inner.buckets.lock();
        assert!(!map.contains_key(&key("a")));
        assert!(map.contains_key(&key("c")));
    }

    #[tokio::test]
    async fn background_task_flushes_on_tick() {
        let cancel = CancellationToken::new();
        let handle = Coalescer::spawn(Duration::from_millis(20), 100, cancel.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        handle.register_callback(key("pods"), Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        handle.enqueue(key("pods"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
        cancel.cancel();
    }
}
