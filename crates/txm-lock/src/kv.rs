use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::LockError;
use crate::provider::{LockProvider, LockToken};

/// Connection to a key/value store that can back a lock.
///
/// Pooling and connection lifecycle belong to the implementor; the lock
/// provider only borrows the connection for single commands.
#[async_trait]
pub trait KeyValueConnection: Send + Sync {
    /// Store `value` at `key` with expiry `ttl` unless a live value exists.
    ///
    /// Equivalent to `SET key value NX PX ttl`. Returns whether the value
    /// was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Delete `key` only if it currently holds `value`.
    ///
    /// Returns whether a value was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockError>;
}

/// [`LockProvider`] backed by a [`KeyValueConnection`].
///
/// Each acquisition writes a fresh holder id as the key's value, and release
/// deletes the key only while it still carries that id.
pub struct KvLockProvider<C> {
    connection: Arc<C>,
}

impl<C> KvLockProvider<C> {
    #[must_use]
    pub fn new(connection: Arc<C>) -> Self {
        Self { connection }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }
}

#[async_trait]
impl<C> LockProvider for KvLockProvider<C>
where
    C: KeyValueConnection,
{
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        if key.is_empty() {
            return Err(LockError::EmptyKey);
        }
        if ttl.is_zero() {
            return Err(LockError::ZeroTtl);
        }

        let holder = Uuid::new_v4().to_string();
        let acquired = self.connection.set_if_absent(key, &holder, ttl).await?;
        debug!(key, acquired, ttl = ?ttl, "lock acquisition attempted");

        Ok(acquired.then(|| LockToken::new(key, ttl, holder)))
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let deleted = self
            .connection
            .delete_if_equals(token.key(), token.holder())
            .await?;
        if !deleted {
            debug!(key = token.key(), "lock expired or changed hands before release");
        }
        Ok(())
    }
}
