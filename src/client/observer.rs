//! Single-slot observer registration.
//!
//! A slot holds at most one callback. Registering replaces the previous one
//! and hands back a token; removing with a stale token is a no-op, so an
//! old owner cannot unregister its successor.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

pub struct ObserverSlot<T> {
    current: Mutex<Option<(ObserverToken, Callback<T>)>>,
    next_token: AtomicU64,
}

impl<T> ObserverSlot<T> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn set(&self, callback: impl Fn(T) + Send + Sync + 'static) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        *self.current.lock() = Some((token, Arc::new(callback)));
        token
    }

    /// Returns false if `token` no longer owns the slot.
    pub fn remove(&self, token: ObserverToken) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some((owner, _)) if *owner == token => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    pub fn is_set(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Invoke the registered callback, if any. The lock is released before the call.
    pub fn notify(&self, value: T) -> bool {
        let callback = self.current.lock().as_ref().map(|(_, cb)| cb.clone());
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }
}

impl<T> Default for ObserverSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
