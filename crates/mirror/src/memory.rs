//! In-process mirror.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::MirrorError;
use crate::{MirrorFuture, StateMirror};

#[derive(Debug, Default)]
struct Store {
    values: HashMap<String, String>,
    history: Vec<(String, String)>,
    failure: Option<String>,
}

/// Mirror that keeps values in memory. Used when no remote mirror is
/// configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryMirror {
    store: Arc<Mutex<Store>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store().values.get(key).cloned()
    }

    /// Every accepted write, oldest first.
    pub fn history(&self) -> Vec<(String, String)> {
        self.store().history.clone()
    }

    /// Makes every write fail with `reason` until cleared with `None`.
    pub fn fail_with(&self, reason: Option<&str>) {
        self.store().failure = reason.map(str::to_string);
    }
}

impl StateMirror for MemoryMirror {
    fn set_value(&self, key: &str, value: &str) -> MirrorFuture<'_> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut store = self.store();
            if let Some(reason) = &store.failure {
                return Err(MirrorError::Unavailable(reason.clone()));
            }
            store.history.push((key.clone(), value.clone()));
            store.values.insert(key, value);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_write_wins() {
        let mirror = MemoryMirror::new();
        mirror.set_value("window_state", "OPEN").await.unwrap();
        mirror.set_value("window_state", "CLOSED").await.unwrap();

        assert_eq!(mirror.get("window_state").as_deref(), Some("CLOSED"));
        assert_eq!(mirror.history().len(), 2);
    }

    #[tokio::test]
    async fn failing_mirror_keeps_old_value() {
        let mirror = MemoryMirror::new();
        mirror.set_value("link_state", "ready").await.unwrap();
        mirror.fail_with(Some("offline"));

        let err = mirror.set_value("link_state", "disconnected").await;
        assert!(matches!(err, Err(MirrorError::Unavailable(r)) if r == "offline"));
        assert_eq!(mirror.get("link_state").as_deref(), Some("ready"));

        mirror.fail_with(None);
        assert!(mirror.set_value("link_state", "idle").await.is_ok());
    }
}
