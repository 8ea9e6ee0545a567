use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::LockError;
use crate::kv::KeyValueConnection;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process [`KeyValueConnection`] with per-key expiry.
///
/// Expiry is measured on the tokio clock, so paused-time tests can advance
/// past a lock's ttl.
#[derive(Debug, Default)]
pub struct MemoryKeyValue {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKeyValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live value at `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in memory, live or not yet swept.
    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries.lock().len()
    }
}

#[async_trait]
impl KeyValueConnection for MemoryKeyValue {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.is_live(now));

        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get(key) else {
            return Ok(false);
        };
        if !entry.is_live(now) {
            entries.remove(key);
            return Ok(false);
        }
        if entry.value != value {
            return Ok(false);
        }

        entries.remove(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_stores_value() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();

        assert!(kv.set_if_absent("k", "v", Duration::from_secs(1)).await?);
        assert_eq!(kv.holder("k").as_deref(), Some("v"));
        assert_eq!(kv.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn set_if_absent_keeps_live_value() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();

        kv.set_if_absent("k", "first", Duration::from_secs(1)).await?;
        let stored = kv.set_if_absent("k", "second", Duration::from_secs(1)).await?;

        assert!(!stored);
        assert_eq!(kv.holder("k").as_deref(), Some("first"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_can_be_replaced() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();

        kv.set_if_absent("k", "first", Duration::from_secs(1)).await?;
        tokio::time::advance(Duration::from_millis(1001)).await;

        assert!(kv.holder("k").is_none());
        assert!(kv.is_empty());
        assert!(kv.set_if_absent("k", "second", Duration::from_secs(1)).await?);
        assert_eq!(kv.holder("k").as_deref(), Some("second"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn insert_sweeps_expired_entries_of_other_keys() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();

        kv.set_if_absent("txm:checkout:order-1", "a", Duration::from_secs(1)).await?;
        kv.set_if_absent("txm:checkout:order-2", "b", Duration::from_secs(1)).await?;
        tokio::time::advance(Duration::from_secs(2)).await;

        kv.set_if_absent("txm:checkout:order-3", "c", Duration::from_secs(1)).await?;

        assert_eq!(kv.stored(), 1);
        assert_eq!(kv.holder("txm:checkout:order-3").as_deref(), Some("c"));
        Ok(())
    }

    #[tokio::test]
    async fn delete_if_equals_ignores_other_values() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();

        kv.set_if_absent("k", "mine", Duration::from_secs(1)).await?;

        assert!(!kv.delete_if_equals("k", "theirs").await?);
        assert_eq!(kv.holder("k").as_deref(), Some("mine"));
        assert!(kv.delete_if_equals("k", "mine").await?);
        assert!(kv.holder("k").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_of_missing_key_reports_nothing_deleted() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();
        assert!(!kv.delete_if_equals("missing", "v").await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn delete_of_expired_value_reports_nothing_deleted() -> anyhow::Result<()> {
        let kv = MemoryKeyValue::new();

        kv.set_if_absent("k", "v", Duration::from_secs(1)).await?;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!kv.delete_if_equals("k", "v").await?);
        Ok(())
    }
}
