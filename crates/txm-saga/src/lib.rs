//! Saga coordinator for business transactions spanning several resources.
//!
//! Each branch of a saga is a named pair of a forward action and a
//! compensating action. [`Coordinator::commit`] takes the transaction lock,
//! opens a local relational scope, runs every forward action concurrently
//! and waits for all of them. If any fails, the succeeded actions are
//! compensated one at a time, most recently completed first, and the scope is
//! rolled back.
//!
//! Data a compensation needs is staged by its forward action in the
//! coordinator's write-once [`ValueStore`] through [`SagaContext::set_val`].

mod audit;
mod context;
mod coordinator;
mod error;
mod options;
mod registry;
mod scope;
mod state;
mod values;

pub use audit::{OutcomeRecord, OutcomeStatus, SagaAuditLog};
pub use context::SagaContext;
pub use coordinator::Coordinator;
pub use error::{
    ActionFailure, CommitError, CompensationError, DuplicateActionError, FailureCause,
    SagaFailure, ValueStoreError,
};
pub use options::{CoordinatorOptions, OptionsError};
pub use registry::{ActionFuture, ActionRegistry, ActionResult, SagaAction};
pub use scope::{
    MemoryScope, MemoryTransactionProvider, ScopeError, TransactionProvider, TransactionScope,
};
pub use state::CoordinatorState;
pub use txm_core::{ActionError, TransactionIdentity};
pub use values::ValueStore;
