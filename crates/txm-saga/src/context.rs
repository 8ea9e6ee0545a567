use std::any::Any;
use std::sync::Arc;

use txm_core::TransactionIdentity;

use crate::error::ValueStoreError;
use crate::values::ValueStore;

/// What a forward or compensating action gets to work with.
///
/// `S` is the open local relational scope; statements issued through it
/// commit or roll back together with the saga.
pub struct SagaContext<S> {
    action: Arc<str>,
    identity: TransactionIdentity,
    values: Arc<ValueStore>,
    scope: Arc<S>,
}

impl<S> SagaContext<S> {
    pub(crate) fn new(
        action: &str,
        identity: TransactionIdentity,
        values: Arc<ValueStore>,
        scope: Arc<S>,
    ) -> Self {
        Self {
            action: Arc::from(action),
            identity,
            values,
            scope,
        }
    }

    /// Name of the action this context was handed to.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn identity(&self) -> &TransactionIdentity {
        &self.identity
    }

    #[must_use]
    pub fn scope(&self) -> &S {
        &self.scope
    }

    #[must_use]
    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    /// Stage a value for a compensation. See [`ValueStore::set`].
    ///
    /// # Errors
    ///
    /// Returns an error if `key` already holds a value.
    pub fn set_val<V>(&self, key: impl Into<String>, value: V) -> Result<(), ValueStoreError>
    where
        V: Any + Send + Sync,
    {
        self.values.set(key, value)
    }

    /// Read a staged value. See [`ValueStore::get`].
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is missing or holds another type.
    pub fn get_val<V>(&self, key: &str) -> Result<V, ValueStoreError>
    where
        V: Any + Clone,
    {
        self.values.get(key)
    }
}

impl<S> Clone for SagaContext<S> {
    fn clone(&self) -> Self {
        Self {
            action: Arc::clone(&self.action),
            identity: self.identity.clone(),
            values: Arc::clone(&self.values),
            scope: Arc::clone(&self.scope),
        }
    }
}

#[cfg(test)]
impl SagaContext<crate::scope::MemoryScope> {
    /// Context outside any coordinator, for exercising single actions.
    pub(crate) fn detached(action: &str) -> Result<Self, txm_core::IdentityError> {
        let identity = TransactionIdentity::new("test", "detached")?;
        let scope = crate::scope::MemoryTransactionProvider::new().open_scope();
        Ok(Self::new(
            action,
            identity,
            Arc::new(ValueStore::new()),
            Arc::new(scope),
        ))
    }
}
