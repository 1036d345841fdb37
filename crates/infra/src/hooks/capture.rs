//! Mutation-capture hook.
//!
//! Turns every single-row write performed by an identified actor into a
//! [`LogEntry`] (before/after snapshots read through the privileged path) and
//! hands it to an [`EntryHandler`].
//!
//! Bulk `Update`/`Delete` are never captured: materializing snapshots for an
//! unbounded row set is not done, so bulk writes leave no entries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fieldops_core::NodeId;
use fieldops_events::{LogEntry, Node, Op};

use super::{Hook, MutationContext, MutationError, Mutator};
use crate::store::{Mutation, MutationOutcome, StoreError};

/// Receives captured entries.
///
/// An error fails the mutation even though the write already happened, so
/// implementations must not have side effects that outlive a failure (e.g.
/// they only schedule deferred work).
#[async_trait]
pub trait EntryHandler: Send + Sync {
    async fn handle(&self, ctx: &MutationContext<'_>, entry: LogEntry) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> EntryHandler for Arc<H>
where
    H: EntryHandler + ?Sized,
{
    async fn handle(&self, ctx: &MutationContext<'_>, entry: LogEntry) -> anyhow::Result<()> {
        (**self).handle(ctx, entry).await
    }
}

/// Chain step performing capture around `next`.
pub struct CaptureHook {
    next: Arc<dyn Mutator>,
    handler: Arc<dyn EntryHandler>,
}

impl CaptureHook {
    /// A [`Hook`] installing capture with `handler`.
    pub fn hook(handler: Arc<dyn EntryHandler>) -> Hook {
        Box::new(move |next: Arc<dyn Mutator>| -> Arc<dyn Mutator> {
            Arc::new(CaptureHook {
                next,
                handler: Arc::clone(&handler),
            })
        })
    }

    /// Privileged snapshot read. `Ok(None)` when the node does not exist.
    async fn snapshot(ctx: &MutationContext<'_>, id: NodeId) -> Result<Option<Node>, StoreError> {
        match ctx.client.node(id).await {
            Ok(node) => Ok(Some(node)),
            Err(err) if err.is_not_found() => {
                debug!(tenant = %ctx.tenant, node_id = %id, "snapshot target not found");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Mutator for CaptureHook {
    async fn mutate(
        &self,
        ctx: &MutationContext<'_>,
        mutation: &Mutation,
    ) -> Result<MutationOutcome, MutationError> {
        let op = mutation.op;
        let actor = match ctx.actor {
            Some(actor) if op.is_single() => actor,
            _ => return self.next.mutate(ctx, mutation).await,
        };

        let previous = match mutation.target() {
            Some(id) => match Self::snapshot(ctx, id).await? {
                None if op == Op::DeleteOne => return Err(StoreError::NotFound(id).into()),
                snapshot => snapshot,
            },
            None => None,
        };

        let outcome = self.next.mutate(ctx, mutation).await?;

        let current = match (op, outcome.id()) {
            (Op::DeleteOne, _) | (_, None) => None,
            (_, Some(id)) => Self::snapshot(ctx, id).await?,
        };

        if previous.is_none() && current.is_none() {
            debug!(tenant = %ctx.tenant, operation = %op, "nothing to capture");
            return Ok(outcome);
        }

        let mut entry = LogEntry::new(actor.name(), actor.user_id(), op);
        entry.previous_state = previous;
        entry.current_state = current;

        self.handler
            .handle(ctx, entry)
            .await
            .map_err(|err| MutationError::Capture(err.into()))?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fieldops_auth::{Identity, Role};
    use fieldops_core::{Tenant, UserId};
    use fieldops_events::{Edge, Field};

    use super::*;
    use crate::hooks::MutationChain;
    use crate::store::{Client, InMemoryDatabase};

    #[derive(Default)]
    struct Collect {
        entries: Mutex<Vec<LogEntry>>,
        fail: bool,
    }

    impl Collect {
        fn failing() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn entries(&self) -> Vec<LogEntry> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EntryHandler for Collect {
        async fn handle(&self, _ctx: &MutationContext<'_>, entry: LogEntry) -> anyhow::Result<()> {
            self.entries.lock().unwrap().push(entry);
            if self.fail {
                anyhow::bail!("handler rejected entry");
            }
            Ok(())
        }
    }

    struct Fixture {
        tenant: Tenant,
        actor: Identity,
        db: InMemoryDatabase,
        collect: Arc<Collect>,
        chain: MutationChain,
    }

    impl Fixture {
        fn with(collect: Collect) -> Self {
            let tenant = Tenant::parse("acme").unwrap();
            let actor = Identity::user(tenant.clone(), UserId::new(3), "ops@acme.test", Role::USER);
            let collect = Arc::new(collect);
            let chain = MutationChain::new([CaptureHook::hook(collect.clone())]);
            Self {
                tenant,
                actor,
                db: InMemoryDatabase::new(),
                collect,
                chain,
            }
        }

        fn new() -> Self {
            Self::with(Collect::default())
        }

        async fn run(&self, m: Mutation) -> Result<MutationOutcome, MutationError> {
            let ctx = MutationContext {
                tenant: &self.tenant,
                actor: Some(&self.actor),
                client: &self.db,
            };
            self.chain.mutate(&ctx, &m).await
        }

        async fn seed(&self) -> NodeId {
            self.db
                .apply(&work_order())
                .await
                .unwrap()
                .id()
                .unwrap()
        }
    }

    fn work_order() -> Mutation {
        Mutation::create("WorkOrder")
            .with_field(Field::new("status", "string", "PLANNED"))
            .with_edge(Edge::new("owner", "User", vec![NodeId::new(3)]))
    }

    #[tokio::test]
    async fn create_captures_current_state_only() {
        let fx = Fixture::new();
        let id = fx.run(work_order()).await.unwrap().id().unwrap();

        let entries = fx.collect.entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.operation, Op::Create);
        assert_eq!(entry.actor_name, "ops@acme.test");
        assert_eq!(entry.actor_id, Some(UserId::new(3)));
        assert!(entry.previous_state.is_none());
        assert_eq!(entry.current_state.as_ref().map(|n| n.id), Some(id));
    }

    #[tokio::test]
    async fn update_one_captures_both_snapshots() {
        let fx = Fixture::new();
        let id = fx.seed().await;

        fx.run(
            Mutation::update_one("WorkOrder", id).with_field(Field::new("status", "string", "DONE")),
        )
        .await
        .unwrap();

        let entries = fx.collect.entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        let before = entry.previous_state.as_ref().unwrap();
        let after = entry.current_state.as_ref().unwrap();
        assert_eq!(before.string_field("status").as_deref(), Some("PLANNED"));
        assert_eq!(after.string_field("status").as_deref(), Some("DONE"));
        assert!(entry.validate().is_ok());
    }

    #[tokio::test]
    async fn delete_one_captures_previous_state_only() {
        let fx = Fixture::new();
        let id = fx.seed().await;

        fx.run(Mutation::delete_one("WorkOrder", id)).await.unwrap();

        let entries = fx.collect.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].previous_state.as_ref().map(|n| n.id), Some(id));
        assert!(entries[0].current_state.is_none());
    }

    #[tokio::test]
    async fn bulk_operations_are_not_captured() {
        let fx = Fixture::new();
        let a = fx.seed().await;
        let b = fx.seed().await;

        let updated = fx
            .run(
                Mutation::update("WorkOrder", vec![a, b])
                    .with_field(Field::new("priority", "string", "HIGH")),
            )
            .await
            .unwrap();
        let deleted = fx.run(Mutation::delete("WorkOrder", vec![a, b])).await.unwrap();

        assert_eq!((updated.affected, deleted.affected), (2, 2));
        assert!(fx.collect.entries().is_empty());
    }

    #[tokio::test]
    async fn missing_actor_skips_capture() {
        let fx = Fixture::new();
        let ctx = MutationContext {
            tenant: &fx.tenant,
            actor: None,
            client: &fx.db,
        };

        fx.chain.mutate(&ctx, &work_order()).await.unwrap();

        assert_eq!(fx.db.node_count(), 1);
        assert!(fx.collect.entries().is_empty());
    }

    #[tokio::test]
    async fn delete_one_of_missing_target_fails_before_writing() {
        let fx = Fixture::new();

        let err = fx
            .run(Mutation::delete_one("WorkOrder", NodeId::new(99)))
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Store(StoreError::NotFound(_))));
        assert!(fx.collect.entries().is_empty());
    }

    #[tokio::test]
    async fn next_error_is_propagated_unchanged() {
        let fx = Fixture::new();

        let err = fx
            .run(Mutation::update_one("WorkOrder", NodeId::new(99)))
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Store(StoreError::NotFound(id)) if id == NodeId::new(99)));
        assert!(fx.collect.entries().is_empty());
    }

    #[tokio::test]
    async fn handler_error_fails_the_mutation_after_the_write() {
        let fx = Fixture::with(Collect::failing());

        let err = fx.run(work_order()).await.unwrap_err();

        assert!(matches!(err, MutationError::Capture(_)));
        assert_eq!(fx.db.node_count(), 1, "the write itself already happened");
    }

    /// Inner step that removes the node it just created.
    struct Vanish {
        next: Arc<dyn Mutator>,
    }

    #[async_trait]
    impl Mutator for Vanish {
        async fn mutate(
            &self,
            ctx: &MutationContext<'_>,
            mutation: &Mutation,
        ) -> Result<MutationOutcome, MutationError> {
            let outcome = self.next.mutate(ctx, mutation).await?;
            if let Some(id) = outcome.id() {
                ctx.client
                    .apply(&Mutation::delete_one(mutation.node_type.clone(), id))
                    .await?;
            }
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn nothing_is_captured_when_both_snapshots_are_missing() {
        let fx = Fixture::new();
        let vanish: Hook = Box::new(|next: Arc<dyn Mutator>| -> Arc<dyn Mutator> {
            Arc::new(Vanish { next })
        });
        let chain = MutationChain::new([CaptureHook::hook(fx.collect.clone()), vanish]);
        let ctx = MutationContext {
            tenant: &fx.tenant,
            actor: Some(&fx.actor),
            client: &fx.db,
        };

        let outcome = chain.mutate(&ctx, &work_order()).await.unwrap();

        assert!(outcome.id().is_some());
        assert_eq!(fx.db.node_count(), 0);
        assert!(fx.collect.entries().is_empty());
    }
}
