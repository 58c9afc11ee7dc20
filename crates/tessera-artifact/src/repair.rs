//! Per-key in-flight markers for idempotent get-or-create paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async lock per key so concurrent callers working on the same
/// key run one at a time, while different keys proceed in parallel.
///
/// Entries are dropped once nobody holds or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
  locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait until the caller is the only one working on `key`.
  pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      locks.retain(|_, weak| weak.strong_count() > 0);
      match locks.get(key).and_then(Weak::upgrade) {
        Some(lock) => lock,
        None => {
          let lock = Arc::new(AsyncMutex::new(()));
          locks.insert(key.to_string(), Arc::downgrade(&lock));
          lock
        }
      }
    };
    lock.lock_owned().await
  }

  /// Number of keys currently held or awaited.
  pub fn in_flight(&self) -> usize {
    let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks.values().filter(|weak| weak.strong_count() > 0).count()
  }
}
