use std::fmt;

use thiserror::Error;
use txm_core::ActionError;
use txm_lock::LockError;

use crate::scope::ScopeError;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("action '{name}' is already registered")]
pub struct DuplicateActionError {
    pub name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValueStoreError {
    #[error("key '{key}' already holds a value")]
    DuplicateKey { key: String },

    #[error("key '{key}' has no value")]
    MissingKey { key: String },

    #[error("key '{key}' holds a {stored}, not a {requested}")]
    TypeMismatch {
        key: String,
        stored: &'static str,
        requested: &'static str,
    },
}

/// Why a forward action did not succeed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FailureCause {
    #[error("branch lock '{key}' is held by another transaction")]
    BranchLockHeld { key: String },

    #[error("branch lock '{key}' could not be acquired")]
    BranchLock {
        key: String,
        #[source]
        source: LockError,
    },

    #[error(transparent)]
    Action(ActionError),

    #[error("action panicked: {0}")]
    Panicked(String),

    #[error("commit deadline passed before the action finished")]
    DeadlineExceeded,

    #[error("commit was cancelled before the action finished")]
    Cancelled,

    #[error("forward unit ended without reporting an outcome: {0}")]
    Unsettled(String),
}

/// A forward action that did not succeed.
#[derive(Debug, Error)]
#[error("action '{action}' failed")]
pub struct ActionFailure {
    /// Name of the action.
    pub action: String,
    #[source]
    pub cause: FailureCause,
}

/// Error from a failed compensation.
///
/// The coordinator does not retry compensations; each of these leaves an
/// effect in place that an operator has to undo.
#[derive(Debug, Error)]
#[error("compensation failed for action '{action}'")]
pub struct CompensationError {
    /// Name of the action whose compensation failed.
    pub action: String,
    /// The underlying error.
    #[source]
    pub error: ActionError,
}

/// Aggregate report of a saga that did not commit.
#[derive(Debug, Default)]
pub struct SagaFailure {
    pub(crate) failures: Vec<ActionFailure>,
    pub(crate) compensated: Vec<String>,
    pub(crate) compensation_errors: Vec<CompensationError>,
    pub(crate) scope_error: Option<ScopeError>,
}

impl SagaFailure {
    /// Forward actions that failed, in the order their failure was observed.
    #[must_use]
    pub fn failures(&self) -> &[ActionFailure] {
        &self.failures
    }

    #[must_use]
    pub fn failed_actions(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.action.as_str()).collect()
    }

    /// Actions whose compensation ran successfully, in execution order.
    #[must_use]
    pub fn compensated(&self) -> &[String] {
        &self.compensated
    }

    #[must_use]
    pub fn compensation_errors(&self) -> &[CompensationError] {
        &self.compensation_errors
    }

    /// Failure of the local relational scope to commit or roll back.
    #[must_use]
    pub fn scope_error(&self) -> Option<&ScopeError> {
        self.scope_error.as_ref()
    }

    /// Whether the commit deadline cut any forward action short.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.cause, FailureCause::DeadlineExceeded))
    }
}

impl fmt::Display for SagaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        for failure in &self.failures {
            parts.push(format!("{failure}: {}", failure.cause));
        }
        if let Some(err) = &self.scope_error {
            parts.push(format!("local transaction: {err}"));
        }
        if !self.compensated.is_empty() {
            parts.push(format!("compensated: {}", self.compensated.join(", ")));
        }
        for err in &self.compensation_errors {
            parts.push(format!("{err}: {}", err.error));
        }

        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for SagaFailure {}

/// Error from [`Coordinator::commit`](crate::Coordinator::commit).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommitError {
    /// The same transaction is already in flight. Nothing was executed, so
    /// retrying later is safe.
    #[error("transaction '{identity}' is already in flight")]
    ConcurrentTransaction { identity: String },

    /// The lock store failed while taking the transaction lock. Nothing was
    /// executed.
    #[error("failed to acquire transaction lock '{key}'")]
    TransactionLock {
        key: String,
        #[source]
        source: LockError,
    },

    /// The local relational scope could not be opened. Nothing was executed.
    #[error("failed to open local transaction")]
    ScopeBegin(#[source] ScopeError),

    /// The commit deadline passed while taking the transaction lock or
    /// opening the local transaction. Nothing was executed.
    #[error("commit deadline passed before any action ran")]
    Timeout,

    /// The commit was cancelled before any action ran.
    #[error("commit was cancelled before any action ran")]
    Cancelled,

    /// The saga failed and every succeeded action was compensated.
    #[error("saga rolled back: {0}")]
    RolledBack(SagaFailure),

    /// The saga failed and at least one compensation failed too.
    #[error("saga rolled back with failed compensations, manual intervention required: {0}")]
    CompensationFailed(SagaFailure),
}

impl CommitError {
    /// The aggregate report, if any action ran.
    #[must_use]
    pub fn failure(&self) -> Option<&SagaFailure> {
        match self {
            Self::RolledBack(failure) | Self::CompensationFailed(failure) => Some(failure),
            Self::ConcurrentTransaction { .. }
            | Self::TransactionLock { .. }
            | Self::ScopeBegin(_)
            | Self::Timeout
            | Self::Cancelled => None,
        }
    }

    /// Whether the error was raised before any side effect took place.
    #[must_use]
    pub fn is_side_effect_free(&self) -> bool {
        self.failure().is_none()
    }

    /// Whether the commit deadline passed, before or during the forward
    /// phase.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            other => other.failure().is_some_and(SagaFailure::is_timeout),
        }
    }

    /// Whether an operator must repair state the coordinator could not undo.
    #[must_use]
    pub fn requires_intervention(&self) -> bool {
        matches!(self, Self::CompensationFailed(_))
    }
}
