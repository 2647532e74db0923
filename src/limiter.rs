//! Per-key admission counter.
//!
//! Bounds how many workers may hold a resource class at once. Tokens are RAII:
//! dropping a [`LimiterToken`] gives the slot back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const UNLIMITED: usize = usize::MAX;

#[derive(Debug)]
struct Slot {
    /// `UNLIMITED` when the key has no ceiling
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl Slot {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit: AtomicUsize::new(limit.unwrap_or(UNLIMITED)),
            used: AtomicUsize::new(0),
        }
    }

    fn limit(&self) -> Option<usize> {
        match self.limit.load(Ordering::Acquire) {
            UNLIMITED => None,
            limit => Some(limit),
        }
    }

    fn try_take(&self) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if current >= self.limit.load(Ordering::Acquire) {
                return false;
            }
            match self
                .used
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn give_back(&self) {
        // Saturates at zero.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(1));
    }
}

/// Concurrency ceiling per resource key. Keys without a configured limit are
/// unbounded but still counted.
#[derive(Debug, Default, Clone)]
pub struct Limiter {
    slots: Arc<Mutex<HashMap<String, Arc<Slot>>>>,
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a limiter from `(key, limit)` pairs.
    pub fn with_limits<I, K>(limits: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<usize>)>,
        K: Into<String>,
    {
        let limiter = Self::new();
        for (key, limit) in limits {
            limiter.set_limit(key, limit);
        }
        limiter
    }

    /// Set or replace the limit for a key. Tokens already out stay counted.
    pub fn set_limit(&self, key: impl Into<String>, limit: Option<usize>) {
        let key: String = key.into();
        let slot = self.slot(&key);
        slot.limit.store(limit.unwrap_or(UNLIMITED), Ordering::Release);
    }

    /// Take one token for `key`, `None` when the key is at its limit.
    pub fn try_acquire(&self, key: &str) -> Option<LimiterToken> {
        let slot = self.slot(key);
        if slot.try_take() {
            Some(LimiterToken {
                key: key.to_string(),
                slot,
            })
        } else {
            tracing::debug!(key, "Limiter refused token");
            None
        }
    }

    /// Tokens currently out for `key`.
    pub fn in_use(&self, key: &str) -> usize {
        self.lock()
            .get(key)
            .map(|slot| slot.used.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn limit(&self, key: &str) -> Option<usize> {
        self.lock().get(key).and_then(|slot| slot.limit())
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        let mut slots = self.lock();
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Slot::new(None)))
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One admitted unit of a resource key; released on drop.
#[derive(Debug)]
pub struct LimiterToken {
    key: String,
    slot: Arc<Slot>,
}

impl LimiterToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LimiterToken {
    fn drop(&mut self) {
        self.slot.give_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let limiter = Limiter::with_limits([("highmem", Some(2))]);
        let a = limiter.try_acquire("highmem");
        let b = limiter.try_acquire("highmem");
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(limiter.try_acquire("highmem").is_none());
        assert_eq!(limiter.in_use("highmem"), 2);
    }

    #[test]
    fn test_drop_releases() {
        let limiter = Limiter::with_limits([("highmem", Some(1))]);
        let token = limiter.try_acquire("highmem").unwrap();
        assert_eq!(token.key(), "highmem");
        assert!(limiter.try_acquire("highmem").is_none());
        drop(token);
        assert_eq!(limiter.in_use("highmem"), 0);
        assert!(limiter.try_acquire("highmem").is_some());
    }

    #[test]
    fn test_unknown_key_is_unlimited_but_counted() {
        let limiter = Limiter::new();
        let tokens: Vec<_> = (0..5).filter_map(|_| limiter.try_acquire("default")).collect();
        assert_eq!(tokens.len(), 5);
        assert_eq!(limiter.in_use("default"), 5);
        assert_eq!(limiter.limit("default"), None);
    }

    #[test]
    fn test_raising_limit_keeps_count() {
        let limiter = Limiter::with_limits([("rc", Some(1))]);
        let _token = limiter.try_acquire("rc").unwrap();
        limiter.set_limit("rc", Some(3));
        assert_eq!(limiter.in_use("rc"), 1);
        assert_eq!(limiter.limit("rc"), Some(3));
        assert!(limiter.try_acquire("rc").is_some());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let limiter = Limiter::with_limits([("rc", Some(3))]);
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.try_acquire("rc")
                })
            })
            .collect();
        let tokens: Vec<_> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(limiter.in_use("rc"), 3);
        drop(tokens);
        assert_eq!(limiter.in_use("rc"), 0);
    }
}
