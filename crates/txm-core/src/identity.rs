use std::fmt;
use std::sync::Arc;

use crate::error::IdentityError;

const KEY_PREFIX: &str = "txm";
const SEPARATOR: char = ':';

/// Stable identity of one logical saga submission.
///
/// Built from a caller-supplied idempotency key and an operation
/// discriminator (typically the name of the calling workflow). Two
/// submissions with the same identity contend for the same
/// transaction-level lock, so a duplicate submitted while the first is in
/// flight is rejected instead of executed twice.
///
/// Cloning is cheap; the components are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionIdentity {
    operation: Arc<str>,
    idempotency_key: Arc<str>,
}

impl TransactionIdentity {
    /// # Errors
    ///
    /// Returns an error if either component is blank or contains `:`.
    pub fn new(
        idempotency_key: impl AsRef<str>,
        operation: impl AsRef<str>,
    ) -> Result<Self, IdentityError> {
        let idempotency_key = idempotency_key.as_ref().trim();
        let operation = operation.as_ref().trim();

        if idempotency_key.is_empty() {
            return Err(IdentityError::EmptyKey);
        }
        if operation.is_empty() {
            return Err(IdentityError::EmptyOperation);
        }
        for component in [idempotency_key, operation] {
            if component.contains(SEPARATOR) {
                return Err(IdentityError::Separator(component.to_string()));
            }
        }

        Ok(Self {
            operation: Arc::from(operation),
            idempotency_key: Arc::from(idempotency_key),
        })
    }

    #[must_use]
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Key of the transaction-level lock.
    #[must_use]
    pub fn lock_key(&self) -> String {
        format!(
            "{KEY_PREFIX}{SEPARATOR}{}{SEPARATOR}{}",
            self.operation, self.idempotency_key
        )
    }

    /// Key of the lock guarding a single branch (action) of this transaction.
    #[must_use]
    pub fn branch_key(&self, action: &str) -> String {
        format!("{}{SEPARATOR}{action}", self.lock_key())
    }
}

impl fmt::Display for TransactionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.operation, self.idempotency_key)
    }
}
