//! Keyed single-flight registry.
//!
//! Concurrent callers asking for the same key share one in-progress future
//! instead of starting a second one.

use std::collections::HashMap;
use std::hash::Hash;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight run for `key`, or start one with `start`.
    pub async fn run<F>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                let shared = start().shared();
                inflight.insert(key.clone(), shared.clone());
                shared
            }
        };

        let value = shared.clone().await;

        let mut inflight = self.inflight.lock();
        if inflight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&shared))
        {
            inflight.remove(&key);
        }
        value
    }

    /// Whether a run for `key` is in flight.
    pub fn is_running(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }
}
