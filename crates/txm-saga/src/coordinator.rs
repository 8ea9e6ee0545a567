use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use txm_core::{ActionError, TransactionIdentity};
use txm_lock::{LockProvider, LockToken, release_best_effort};

use crate::audit::SagaAuditLog;
use crate::context::SagaContext;
use crate::error::{
    ActionFailure, CommitError, CompensationError, DuplicateActionError, FailureCause,
    SagaFailure, ValueStoreError,
};
use crate::options::CoordinatorOptions;
use crate::registry::{ActionRegistry, ActionResult, SagaAction};
use crate::scope::{ScopeError, TransactionProvider, TransactionScope};
use crate::state::CoordinatorState;
use crate::values::ValueStore;

/// Runs one business transaction as a saga.
///
/// A coordinator is built per logical operation, given its actions, and
/// consumed by [`commit`](Self::commit).
///
/// ```
/// use std::sync::Arc;
/// use txm_lock::{KvLockProvider, MemoryKeyValue};
/// use txm_saga::{Coordinator, CoordinatorOptions, MemoryTransactionProvider, TransactionIdentity};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let locks = Arc::new(KvLockProvider::new(Arc::new(MemoryKeyValue::new())));
/// let transactions = Arc::new(MemoryTransactionProvider::new());
/// let identity = TransactionIdentity::new("order-7", "checkout")?;
///
/// let mut saga = Coordinator::new(identity, locks, Arc::clone(&transactions), CoordinatorOptions::default());
/// saga.register(
///     "reserve_stock",
///     |ctx| async move {
///         ctx.scope().execute("UPDATE stock SET qty = qty - 1")?;
///         ctx.set_val("reserved", 1_u32)?;
///         Ok(())
///     },
///     |ctx| async move {
///         let reserved: u32 = ctx.get_val("reserved")?;
///         println!("releasing {reserved}");
///         Ok(())
///     },
/// )?;
///
/// saga.commit().await?;
/// assert_eq!(transactions.committed(), vec!["UPDATE stock SET qty = qty - 1"]);
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<L: ?Sized, T: TransactionProvider> {
    identity: TransactionIdentity,
    locks: Arc<L>,
    transactions: Arc<T>,
    options: CoordinatorOptions,
    registry: ActionRegistry<T::Scope>,
    values: Arc<ValueStore>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl<L, T> Coordinator<L, T>
where
    L: LockProvider + ?Sized + 'static,
    T: TransactionProvider,
{
    #[must_use]
    pub fn new(
        identity: TransactionIdentity,
        locks: Arc<L>,
        transactions: Arc<T>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            identity,
            locks,
            transactions,
            options,
            registry: ActionRegistry::new(),
            values: Arc::new(ValueStore::new()),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Absolute deadline for the commit. The earlier of this and the
    /// `timeout` option applies.
    ///
    /// It bounds taking the transaction lock, opening the local transaction
    /// and the forward actions. Compensations always run to completion.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cancelling `token` before any action runs ends the commit without side
    /// effects; cancelling it while forward actions run stops them and starts
    /// compensation.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn identity(&self) -> &TransactionIdentity {
        &self.identity
    }

    #[must_use]
    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Register a forward action together with its compensation.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is already registered.
    pub fn register<F, Fut, C, CFut>(
        &mut self,
        name: impl Into<String>,
        forward: F,
        compensate: C,
    ) -> Result<(), DuplicateActionError>
    where
        F: Fn(SagaContext<T::Scope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
        C: Fn(SagaContext<T::Scope>) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = ActionResult> + Send + 'static,
    {
        self.registry.register(SagaAction::new(name, forward, compensate))
    }

    /// # Errors
    ///
    /// Returns an error if an action with the same name is registered.
    pub fn register_action(&mut self, action: SagaAction<T::Scope>) -> Result<(), DuplicateActionError> {
        self.registry.register(action)
    }

    pub fn registered_actions(&self) -> impl Iterator<Item = &str> {
        self.registry.names()
    }

    /// # Errors
    ///
    /// Returns an error if `key` already holds a value.
    pub fn set_val<V>(&self, key: impl Into<String>, value: V) -> Result<(), ValueStoreError>
    where
        V: Any + Send + Sync,
    {
        self.values.set(key, value)
    }

    /// # Errors
    ///
    /// Returns an error if `key` is missing or holds another type.
    pub fn get_val<V>(&self, key: &str) -> Result<V, ValueStoreError>
    where
        V: Any + Clone,
    {
        self.values.get(key)
    }

    /// Run the saga.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::ConcurrentTransaction`] if the same transaction
    /// is already in flight, [`CommitError::Timeout`] or
    /// [`CommitError::Cancelled`] if interrupted before any action ran,
    /// [`CommitError::RolledBack`] if an action failed
    /// and every succeeded action was compensated, and
    /// [`CommitError::CompensationFailed`] if a compensation failed as well.
    pub async fn commit(self) -> Result<(), CommitError> {
        self.commit_with_audit().await.0
    }

    /// Run the saga and return the audit log alongside the result.
    pub async fn commit_with_audit(self) -> (Result<(), CommitError>, SagaAuditLog) {
        let started = Instant::now();
        let actions = self.registry.snapshot();
        let audit = SagaAuditLog::new(actions.iter().map(SagaAction::name));
        let table = Arc::new(Mutex::new(ForwardTable::new(audit)));

        let result = self.run(&actions, &table, started).await;

        let audit = std::mem::take(&mut table.lock().audit);
        (result, audit)
    }

    async fn run(
        &self,
        actions: &[SagaAction<T::Scope>],
        table: &Arc<Mutex<ForwardTable>>,
        started: Instant,
    ) -> Result<(), CommitError> {
        let deadline = self.effective_deadline(started);
        let key = self.identity.lock_key();
        let acquired = match self
            .bounded(deadline, self.locks.try_acquire(&key, self.options.lock_ttl()))
            .await
        {
            Ok(acquired) => acquired,
            Err(interruption) => {
                self.transition(table, CoordinatorState::FatalError);
                warn!(
                    identity = %self.identity,
                    key = %key,
                    error = %interruption.cause(),
                    "commit interrupted before locking"
                );
                return Err(interruption.commit_error());
            }
        };
        let txn_token = match acquired {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.transition(table, CoordinatorState::LockFailed);
                info!(identity = %self.identity, key = %key, "transaction already in flight");
                return Err(CommitError::ConcurrentTransaction {
                    identity: self.identity.to_string(),
                });
            }
            Err(source) => {
                self.transition(table, CoordinatorState::FatalError);
                return Err(CommitError::TransactionLock { key, source });
            }
        };
        debug!(identity = %self.identity, key = %key, "acquired transaction lock");
        self.transition(table, CoordinatorState::Locked);

        let scope = match self.bounded(deadline, self.transactions.begin()).await {
            Ok(Ok(scope)) => Arc::new(scope),
            Ok(Err(err)) => {
                self.transition(table, CoordinatorState::FatalError);
                self.release(&txn_token).await;
                return Err(CommitError::ScopeBegin(err));
            }
            Err(interruption) => {
                self.transition(table, CoordinatorState::FatalError);
                warn!(
                    identity = %self.identity,
                    error = %interruption.cause(),
                    "commit interrupted before opening the local transaction"
                );
                self.release(&txn_token).await;
                return Err(interruption.commit_error());
            }
        };

        self.transition(table, CoordinatorState::ForwardRunning);
        self.run_forward(actions, table, &scope, deadline).await;

        let failed = !table.lock().failures.is_empty();
        let scope_error = if failed {
            None
        } else {
            self.transition(table, CoordinatorState::AllSucceeded);
            match scope.commit().await {
                Ok(()) => {
                    self.transition(table, CoordinatorState::Committed);
                    self.release_all(table, &txn_token).await;
                    info!(identity = %self.identity, actions = actions.len(), "saga committed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(identity = %self.identity, error = %err, "local transaction failed to commit");
                    Some(err)
                }
            }
        };

        self.transition(table, CoordinatorState::AnyFailed);
        let report = self.unwind(actions, table, &scope, scope_error).await;
        self.transition(table, CoordinatorState::Compensated);
        self.release_all(table, &txn_token).await;

        if report.compensation_errors.is_empty() {
            info!(identity = %self.identity, %report, "saga rolled back");
            Err(CommitError::RolledBack(report))
        } else {
            error!(identity = %self.identity, %report, "saga rolled back with failed compensations");
            Err(CommitError::CompensationFailed(report))
        }
    }

    async fn run_forward(
        &self,
        actions: &[SagaAction<T::Scope>],
        table: &Arc<Mutex<ForwardTable>>,
        scope: &Arc<T::Scope>,
        deadline: Option<Instant>,
    ) {
        let mut units = JoinSet::new();
        for action in actions {
            let unit = ForwardUnit {
                ctx: SagaContext::new(
                    action.name(),
                    self.identity.clone(),
                    Arc::clone(&self.values),
                    Arc::clone(scope),
                ),
                action: action.clone(),
                locks: Arc::clone(&self.locks),
                table: Arc::clone(table),
                options: self.options.clone(),
            };
            units.spawn(unit.run());
        }

        let interruption = tokio::select! {
            biased;
            () = drain(&mut units) => None,
            () = self.cancellation.cancelled() => Some(Interruption::Cancelled),
            () = expiry(deadline) => Some(Interruption::Deadline),
        };

        if interruption.is_some() {
            units.shutdown().await;
        }

        // Every action must leave the forward phase settled, whatever ended
        // its unit.
        let mut table = table.lock();
        for name in table.audit.pending_actions() {
            let cause = match interruption {
                Some(interruption) => interruption.cause(),
                None => FailureCause::Unsettled("unit stopped before recording a result".to_string()),
            };
            warn!(identity = %self.identity, action = %name, error = %cause, "forward action abandoned");
            if table.audit.record_failure(&name, cause.to_string()) {
                table.failures.push(ActionFailure {
                    action: name,
                    cause,
                });
            }
        }
    }

    /// Race `step` against cancellation and the deadline. Interruptions win
    /// ties, so an already cancelled or expired commit never starts `step`.
    async fn bounded<F>(
        &self,
        deadline: Option<Instant>,
        step: F,
    ) -> Result<F::Output, Interruption>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(Interruption::Cancelled),
            () = expiry(deadline) => Err(Interruption::Deadline),
            output = step => Ok(output),
        }
    }

    /// Compensate every succeeded action, most recently completed first, then
    /// roll back the local transaction unless it already failed to commit.
    async fn unwind(
        &self,
        actions: &[SagaAction<T::Scope>],
        table: &Arc<Mutex<ForwardTable>>,
        scope: &Arc<T::Scope>,
        scope_error: Option<ScopeError>,
    ) -> SagaFailure {
        let (failures, order) = {
            let mut table = table.lock();
            let order: Vec<String> = table.audit.completion_order().iter().rev().cloned().collect();
            (std::mem::take(&mut table.failures), order)
        };
        self.transition(table, CoordinatorState::CompensationRunning);

        let mut report = SagaFailure {
            failures,
            ..SagaFailure::default()
        };

        for name in order {
            let Some(action) = actions.iter().find(|action| action.name() == name) else {
                continue;
            };
            let ctx = SagaContext::new(
                &name,
                self.identity.clone(),
                Arc::clone(&self.values),
                Arc::clone(scope),
            );

            match guarded(action.compensate(ctx)).await {
                Ok(()) => {
                    debug!(identity = %self.identity, action = %name, "compensated");
                    table.lock().audit.record_compensated(&name);
                    report.compensated.push(name);
                }
                Err(guarded) => {
                    let err = guarded.into_error();
                    error!(identity = %self.identity, action = %name, error = %err, "compensation failed");
                    table
                        .lock()
                        .audit
                        .record_compensation_failed(&name, err.to_string());
                    report.compensation_errors.push(CompensationError {
                        action: name,
                        error: err,
                    });
                }
            }
        }

        report.scope_error = match scope_error {
            Some(err) => Some(err),
            None => match scope.rollback().await {
                Ok(()) => {
                    debug!(identity = %self.identity, "local transaction rolled back");
                    None
                }
                Err(err) => {
                    warn!(identity = %self.identity, error = %err, "local transaction failed to roll back");
                    Some(err)
                }
            },
        };

        report
    }

    fn effective_deadline(&self, started: Instant) -> Option<Instant> {
        let relative = self.options.timeout().map(|timeout| started + timeout);
        match (self.deadline, relative) {
            (Some(absolute), Some(relative)) => Some(absolute.min(relative)),
            (absolute, relative) => absolute.or(relative),
        }
    }

    fn transition(&self, table: &Mutex<ForwardTable>, to: CoordinatorState) {
        let mut table = table.lock();
        let from = table.audit.state();
        table.audit.set_state(to);
        debug!(identity = %self.identity, %from, %to, "state transition");
    }

    async fn release_all(&self, table: &Mutex<ForwardTable>, txn_token: &LockToken) {
        let branch_tokens = std::mem::take(&mut table.lock().branch_tokens);
        for token in branch_tokens.iter().rev() {
            self.release(token).await;
        }
        self.release(txn_token).await;
    }

    async fn release(&self, token: &LockToken) {
        release_best_effort(
            &*self.locks,
            token,
            self.options.release_attempts(),
            self.options.poll_interval(),
        )
        .await;
    }
}

/// State shared between the forward units of one commit.
#[derive(Debug, Default)]
struct ForwardTable {
    audit: SagaAuditLog,
    failures: Vec<ActionFailure>,
    branch_tokens: Vec<LockToken>,
}

impl ForwardTable {
    fn new(audit: SagaAuditLog) -> Self {
        Self {
            audit,
            ..Self::default()
        }
    }
}

struct ForwardUnit<L: ?Sized, S> {
    action: SagaAction<S>,
    ctx: SagaContext<S>,
    locks: Arc<L>,
    table: Arc<Mutex<ForwardTable>>,
    options: CoordinatorOptions,
}

impl<L, S> ForwardUnit<L, S>
where
    L: LockProvider + ?Sized,
    S: 'static,
{
    async fn run(self) {
        if let Err(payload) = AssertUnwindSafe(self.execute()).catch_unwind().await {
            self.fail(FailureCause::Panicked(panic_message(payload.as_ref())));
        }
    }

    async fn execute(&self) {
        let name = self.action.name();
        self.table.lock().audit.record_start(name);

        let key = self.ctx.identity().branch_key(name);
        let acquired = self.locks.try_acquire(&key, self.options.lock_ttl()).await;
        match acquired {
            Ok(Some(token)) => {
                debug!(identity = %self.ctx.identity(), action = name, key = %key, "acquired branch lock");
                self.table.lock().branch_tokens.push(token);
            }
            Ok(None) => {
                self.fail(FailureCause::BranchLockHeld { key });
                return;
            }
            Err(source) => {
                self.fail(FailureCause::BranchLock { key, source });
                return;
            }
        }

        match guarded(self.action.forward(self.ctx.clone())).await {
            Ok(()) => {
                if self.table.lock().audit.record_success(name) {
                    debug!(identity = %self.ctx.identity(), action = name, "forward action succeeded");
                }
            }
            Err(Guarded::Failed(err)) => self.fail(FailureCause::Action(err)),
            Err(Guarded::Panicked(message)) => self.fail(FailureCause::Panicked(message)),
        }
    }

    fn fail(&self, cause: FailureCause) {
        let name = self.action.name();
        warn!(identity = %self.ctx.identity(), action = name, error = %cause, "forward action failed");

        let mut table = self.table.lock();
        if table.audit.record_failure(name, cause.to_string()) {
            table.failures.push(ActionFailure {
                action: name.to_string(),
                cause,
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Interruption {
    Deadline,
    Cancelled,
}

impl Interruption {
    fn cause(self) -> FailureCause {
        match self {
            Self::Deadline => FailureCause::DeadlineExceeded,
            Self::Cancelled => FailureCause::Cancelled,
        }
    }

    fn commit_error(self) -> CommitError {
        match self {
            Self::Deadline => CommitError::Timeout,
            Self::Cancelled => CommitError::Cancelled,
        }
    }
}

enum Guarded {
    Failed(ActionError),
    Panicked(String),
}

impl Guarded {
    fn into_error(self) -> ActionError {
        match self {
            Self::Failed(err) => err,
            Self::Panicked(message) => format!("action panicked: {message}").into(),
        }
    }
}

/// Await an action, turning a panic into an error.
async fn guarded<F>(action: F) -> Result<(), Guarded>
where
    F: Future<Output = ActionResult>,
{
    match AssertUnwindSafe(action).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Guarded::Failed(err)),
        Err(payload) => Err(Guarded::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn drain(units: &mut JoinSet<()>) {
    while let Some(joined) = units.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "forward unit did not run to completion");
        }
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use txm_lock::{KvLockProvider, MemoryKeyValue};

    use super::*;
    use crate::audit::OutcomeStatus;
    use crate::scope::MemoryTransactionProvider;

    type TestCoordinator = Coordinator<KvLockProvider<MemoryKeyValue>, MemoryTransactionProvider>;

    fn coordinator(options: CoordinatorOptions) -> anyhow::Result<TestCoordinator> {
        let locks = Arc::new(KvLockProvider::new(Arc::new(MemoryKeyValue::new())));
        let identity = TransactionIdentity::new("order-1", "checkout")?;
        Ok(Coordinator::new(
            identity,
            locks,
            Arc::new(MemoryTransactionProvider::new()),
            options,
        ))
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_wins() -> anyhow::Result<()> {
        let started = Instant::now();
        let options = CoordinatorOptions::default().with_timeout(Duration::from_secs(10));

        let relative_only = coordinator(options.clone())?;
        assert_eq!(
            relative_only.effective_deadline(started),
            Some(started + Duration::from_secs(10))
        );

        let absolute_first =
            coordinator(options)?.with_deadline(started + Duration::from_secs(2));
        assert_eq!(
            absolute_first.effective_deadline(started),
            Some(started + Duration::from_secs(2))
        );

        let unbounded = coordinator(CoordinatorOptions::default())?;
        assert_eq!(unbounded.effective_deadline(started), None);
        Ok(())
    }

    #[tokio::test]
    async fn coordinator_values_are_visible_to_actions() -> anyhow::Result<()> {
        let mut saga = coordinator(CoordinatorOptions::default())?;
        saga.set_val("order_id", 7_u64)?;
        saga.register(
            "read_order",
            |ctx| async move {
                let order: u64 = ctx.get_val("order_id")?;
                ctx.set_val("seen", order)?;
                Ok(())
            },
            |_ctx| async { Ok(()) },
        )?;

        let (result, audit) = saga.commit_with_audit().await;

        result?;
        assert_eq!(audit.state(), CoordinatorState::Committed);
        assert_eq!(
            audit.record("read_order").map(|r| r.status),
            Some(OutcomeStatus::Succeeded)
        );
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() -> anyhow::Result<()> {
        let mut saga = coordinator(CoordinatorOptions::default())?;
        saga.register("x", |_ctx| async { Ok(()) }, |_ctx| async { Ok(()) })?;

        let result = saga.register("x", |_ctx| async { Ok(()) }, |_ctx| async { Ok(()) });

        assert!(result.is_err());
        assert_eq!(saga.registered_actions().collect::<Vec<_>>(), vec!["x"]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_action_drives_state_through_compensation() -> anyhow::Result<()> {
        let mut saga = coordinator(CoordinatorOptions::default())?;
        saga.register("ok", |_ctx| async { Ok(()) }, |_ctx| async { Ok(()) })?;
        saga.register(
            "bad",
            |_ctx| async { Err("declined".into()) },
            |_ctx| async { Ok(()) },
        )?;

        let (result, audit) = saga.commit_with_audit().await;

        assert!(matches!(result, Err(CommitError::RolledBack(_))));
        assert_eq!(audit.state(), CoordinatorState::Compensated);
        assert_eq!(
            audit.record("ok").map(|r| r.status),
            Some(OutcomeStatus::Compensated)
        );
        assert_eq!(
            audit.record("bad").and_then(|r| r.reason.clone()),
            Some("declined".to_string())
        );
        Ok(())
    }
}
