use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// A reusable resource that can go stale while it sits idle.
pub trait Pooled: Send {
    fn has_expired(&self) -> bool;

    /// Called each time the pool hands the value out.
    fn notify_used(&mut self);
}

/// Idle connections keyed by endpoint.
///
/// The pool only ever holds idle values: `take` moves one out to the caller
/// and `return_connection` moves it back. Values the pool refuses or evicts
/// are handed back so the caller can close them properly.
pub struct ConnectionPool<K, V> {
    max_idle_per_key: usize,
    idle: Mutex<HashMap<K, VecDeque<V>>>,
}

impl<K, V> ConnectionPool<K, V>
where
    K: Eq + Hash + Clone,
    V: Pooled,
{
    pub fn new(max_idle_per_key: usize) -> Self {
        Self { max_idle_per_key, idle: Mutex::new(HashMap::new()) }
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<K, VecDeque<V>>> {
        self.idle.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Most recently returned live value for `key`, with expired ones
    /// handed back for disposal.
    pub fn take(&self, key: &K) -> (Option<V>, Vec<V>) {
        let mut idle = self.idle();
        let mut expired = Vec::new();
        let Some(values) = idle.get_mut(key) else {
            return (None, expired);
        };
        let mut found = None;
        while let Some(mut value) = values.pop_back() {
            if value.has_expired() {
                expired.push(value);
                continue;
            }
            value.notify_used();
            found = Some(value);
            break;
        }
        if values.is_empty() {
            idle.remove(key);
        }
        (found, expired)
    }

    /// Puts `value` back. Returns whatever must be disposed instead: the
    /// value itself if it expired, or the oldest idle value when the key is
    /// over capacity.
    pub fn return_connection(&self, key: K, value: V) -> Option<V> {
        if value.has_expired() || self.max_idle_per_key == 0 {
            return Some(value);
        }
        let mut idle = self.idle();
        let values = idle.entry(key).or_default();
        values.push_back(value);
        if values.len() > self.max_idle_per_key {
            values.pop_front()
        } else {
            None
        }
    }

    pub fn clear(&self, key: &K) -> Vec<V> {
        self.idle().remove(key).map(Vec::from).unwrap_or_default()
    }

    pub fn count(&self, key: &K) -> usize {
        self.idle().get(key).map_or(0, VecDeque::len)
    }

    pub fn dispose(&self) -> Vec<V> {
        self.idle().drain().flat_map(|(_, values)| values).collect()
    }
}
