use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::LockError;

/// Proof of a held lock, returned by [`LockProvider::try_acquire`].
///
/// `holder` is unique per acquisition, so releasing a token whose lock
/// already expired and was taken by someone else leaves the new holder's
/// lock in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    ttl: Duration,
    holder: String,
}

impl LockToken {
    #[must_use]
    pub fn new(key: impl Into<String>, ttl: Duration, holder: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl,
            holder: holder.into(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Atomic check-and-set lock with expiry.
///
/// Implementations must make `try_acquire` atomic: of any number of
/// concurrent callers for one free key, exactly one receives a token.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to take the lock at `key` for `ttl`.
    ///
    /// Returns `Ok(None)` if the lock is currently held.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or ttl is invalid or the lock store
    /// cannot be reached.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Release a previously acquired lock.
    ///
    /// Releasing a lock that already expired is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store cannot be reached.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

/// Release `token`, retrying up to `attempts` times with `interval` between
/// attempts.
///
/// Failures are logged, never returned: a lock that cannot be released
/// still expires once its ttl runs out. Returns whether the release went
/// through.
pub async fn release_best_effort<P>(
    provider: &P,
    token: &LockToken,
    attempts: u32,
    interval: Duration,
) -> bool
where
    P: LockProvider + ?Sized,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match provider.release(token).await {
            Ok(()) => {
                debug!(key = token.key(), attempt, "released lock");
                return true;
            }
            Err(err) if attempt < attempts => {
                warn!(key = token.key(), attempt, error = %err, "lock release failed, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(err) => {
                error!(
                    key = token.key(),
                    attempts,
                    ttl = ?token.ttl(),
                    error = %err,
                    "giving up on lock release, lock will expire after its ttl"
                );
            }
        }
    }

    false
}
