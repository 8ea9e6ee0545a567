use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use txm_core::ActionError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScopeError {
    #[error("failed to begin transaction")]
    Begin(#[source] ActionError),

    #[error("failed to commit transaction")]
    Commit(#[source] ActionError),

    #[error("failed to roll back transaction")]
    Rollback(#[source] ActionError),

    #[error("transaction is already closed")]
    Closed,
}

/// An open local transaction.
///
/// The coordinator calls exactly one of `commit` or `rollback` once every
/// forward action has finished.
#[async_trait]
pub trait TransactionScope: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns an error if the transaction could not be committed; the store
    /// is expected to have rolled it back.
    async fn commit(&self) -> Result<(), ScopeError>;

    /// # Errors
    ///
    /// Returns an error if the rollback could not be confirmed.
    async fn rollback(&self) -> Result<(), ScopeError>;
}

/// Source of local relational transactions.
#[async_trait]
pub trait TransactionProvider: Send + Sync + 'static {
    type Scope: TransactionScope;

    /// # Errors
    ///
    /// Returns an error if no transaction could be opened.
    async fn begin(&self) -> Result<Self::Scope, ScopeError>;
}

#[derive(Debug, Default)]
struct Ledger {
    committed: Mutex<Vec<String>>,
    begun: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// In-memory [`TransactionProvider`] recording statements as strings.
///
/// Statements issued through a [`MemoryScope`] are staged and appended to
/// the provider's committed log on commit, or discarded on rollback.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionProvider {
    ledger: Arc<Ledger>,
}

impl MemoryTransactionProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a scope without going through the async trait.
    #[must_use]
    pub fn open_scope(&self) -> MemoryScope {
        self.ledger.begun.fetch_add(1, Ordering::SeqCst);
        MemoryScope {
            ledger: Arc::clone(&self.ledger),
            state: Mutex::new(ScopeState::Open(Vec::new())),
        }
    }

    /// Every statement committed so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<String> {
        self.ledger.committed.lock().clone()
    }

    #[must_use]
    pub fn begun(&self) -> usize {
        self.ledger.begun.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.ledger.commits.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.ledger.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionProvider for MemoryTransactionProvider {
    type Scope = MemoryScope;

    async fn begin(&self) -> Result<MemoryScope, ScopeError> {
        Ok(self.open_scope())
    }
}

#[derive(Debug)]
enum ScopeState {
    Open(Vec<String>),
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct MemoryScope {
    ledger: Arc<Ledger>,
    state: Mutex<ScopeState>,
}

impl MemoryScope {
    /// Stage a statement.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Closed`] once the scope has committed or rolled
    /// back.
    pub fn execute(&self, statement: impl Into<String>) -> Result<(), ScopeError> {
        match &mut *self.state.lock() {
            ScopeState::Open(staged) => {
                staged.push(statement.into());
                Ok(())
            }
            ScopeState::Committed | ScopeState::RolledBack => Err(ScopeError::Closed),
        }
    }

    /// Statements staged and not yet committed.
    #[must_use]
    pub fn staged(&self) -> Vec<String> {
        match &*self.state.lock() {
            ScopeState::Open(staged) => staged.clone(),
            ScopeState::Committed | ScopeState::RolledBack => Vec::new(),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), ScopeState::Open(_))
    }

    fn close(&self, next: ScopeState) -> Result<Vec<String>, ScopeError> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, next) {
            ScopeState::Open(staged) => Ok(staged),
            closed => {
                *state = closed;
                Err(ScopeError::Closed)
            }
        }
    }
}

#[async_trait]
impl TransactionScope for MemoryScope {
    async fn commit(&self) -> Result<(), ScopeError> {
        let staged = self.close(ScopeState::Committed)?;
        self.ledger.committed.lock().extend(staged);
        self.ledger.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ScopeError> {
        self.close(ScopeState::RolledBack)?;
        self.ledger.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
