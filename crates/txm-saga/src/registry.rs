use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use indexmap::map::Entry;
use txm_core::ActionError;

use crate::context::SagaContext;
use crate::error::DuplicateActionError;

/// Result of a forward or compensating action.
///
/// Whatever the action produces besides success or failure is not
/// interpreted by the coordinator; state a compensation needs goes into the
/// value store.
pub type ActionResult = Result<(), ActionError>;

pub type ActionFuture = BoxFuture<'static, ActionResult>;

type ActionFn<S> = Arc<dyn Fn(SagaContext<S>) -> ActionFuture + Send + Sync>;

fn erase<S, F, Fut>(action: F) -> ActionFn<S>
where
    S: 'static,
    F: Fn(SagaContext<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(move |ctx| -> ActionFuture { Box::pin(action(ctx)) })
}

/// One branch of a saga: a forward action and the compensation undoing it.
///
/// `S` is the relational scope type handed to both through [`SagaContext`].
pub struct SagaAction<S> {
    name: Arc<str>,
    forward: ActionFn<S>,
    compensate: ActionFn<S>,
}

impl<S> SagaAction<S> {
    pub fn new<F, Fut, C, CFut>(name: impl Into<String>, forward: F, compensate: C) -> Self
    where
        S: 'static,
        F: Fn(SagaContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
        C: Fn(SagaContext<S>) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = ActionResult> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            forward: erase(forward),
            compensate: erase(compensate),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn forward(&self, ctx: SagaContext<S>) -> ActionFuture {
        (self.forward)(ctx)
    }

    pub(crate) fn compensate(&self, ctx: SagaContext<S>) -> ActionFuture {
        (self.compensate)(ctx)
    }
}

impl<S> Clone for SagaAction<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            forward: Arc::clone(&self.forward),
            compensate: Arc::clone(&self.compensate),
        }
    }
}

/// Registered saga actions keyed by unique name, in registration order.
///
/// Forward and compensating functions live in one entry, so a name can never
/// end up with only one of the two.
pub struct ActionRegistry<S> {
    actions: IndexMap<String, SagaAction<S>>,
}

impl<S> ActionRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: IndexMap::new(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if an action with the same name is registered; the
    /// existing registration is left unchanged.
    pub fn register(&mut self, action: SagaAction<S>) -> Result<(), DuplicateActionError> {
        match self.actions.entry(action.name().to_string()) {
            Entry::Occupied(occupied) => Err(DuplicateActionError {
                name: occupied.key().clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(action);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SagaAction<S>> {
        self.actions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Stable copy of the registered actions in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SagaAction<S>> {
        self.actions.values().cloned().collect()
    }
}

impl<S> Default for ActionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::scope::MemoryScope;

    fn noop(name: &str) -> SagaAction<MemoryScope> {
        SagaAction::new(name, |_ctx| async { Ok(()) }, |_ctx| async { Ok(()) })
    }

    #[test]
    fn register_keeps_registration_order() -> Result<(), DuplicateActionError> {
        let mut registry = ActionRegistry::new();

        registry.register(noop("reserve_stock"))?;
        registry.register(noop("create_delivery"))?;
        registry.register(noop("update_sale_order"))?;

        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec!["reserve_stock", "create_delivery", "update_sale_order"]
        );
        Ok(())
    }

    #[test]
    fn duplicate_name_is_rejected() -> Result<(), DuplicateActionError> {
        let mut registry = ActionRegistry::new();
        registry.register(noop("x"))?;

        let result = registry.register(noop("x"));

        assert_eq!(
            result,
            Err(DuplicateActionError {
                name: "x".to_string()
            })
        );
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_registration_leaves_first_pair_in_place() -> anyhow::Result<()> {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::<MemoryScope>::new();

        let counter = Arc::clone(&first_calls);
        registry.register(SagaAction::new(
            "x",
            move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            |_ctx| async { Ok(()) },
        ))?;

        let counter = Arc::clone(&second_calls);
        let duplicate = registry.register(SagaAction::new(
            "x",
            move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            |_ctx| async { Ok(()) },
        ));
        assert!(duplicate.is_err());

        let action = registry
            .get("x")
            .ok_or_else(|| anyhow::anyhow!("x should be registered"))?;
        action.forward(SagaContext::detached("x")?).await.map_err(|e| anyhow::anyhow!(e))?;

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn snapshot_is_independent_of_later_registrations() -> Result<(), DuplicateActionError> {
        let mut registry = ActionRegistry::new();
        registry.register(noop("a"))?;

        let snapshot = registry.snapshot();
        registry.register(noop("b"))?;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "a");
        assert_eq!(registry.len(), 2);
        Ok(())
    }
}
