//! Deferred-until-commit emission.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use fieldops_events::{Emitter, LogEntry};

use super::{EntryHandler, MutationContext};
use crate::store::{Client, StoreError};

/// Publish `value` once the client's transaction commits.
///
/// On a non-transactional client the publish happens before this returns.
/// Encoding and publish failures are logged and swallowed: emission is
/// best-effort and never fails the originating write. Only registering the
/// callback on a finished transaction is reported as an error.
pub async fn emit_on_commit<T>(
    client: &dyn Client,
    emitter: Arc<dyn Emitter>,
    tenant: &str,
    name: &str,
    value: &T,
) -> Result<(), StoreError>
where
    T: Serialize + ?Sized + Sync,
{
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => {
            warn!(tenant, event = name, error = %err, "dropping event: encoding failed");
            return Ok(());
        }
    };

    let tenant = tenant.to_string();
    let name = name.to_string();
    client
        .on_commit(Box::new(move || {
            async move {
                match emitter.emit(&tenant, &name, body).await {
                    Ok(()) => debug!(tenant = %tenant, event = %name, "event emitted"),
                    Err(err) => {
                        warn!(tenant = %tenant, event = %name, error = %err, "dropping event: publish failed")
                    }
                }
            }
            .boxed()
        }))
        .await
}

/// [`EntryHandler`] publishing captured entries under a fixed event name.
pub struct EmitOnCommit {
    emitter: Arc<dyn Emitter>,
    event: String,
}

impl EmitOnCommit {
    pub fn new(emitter: Arc<dyn Emitter>, event: impl Into<String>) -> Self {
        Self {
            emitter,
            event: event.into(),
        }
    }
}

#[async_trait]
impl EntryHandler for EmitOnCommit {
    async fn handle(&self, ctx: &MutationContext<'_>, entry: LogEntry) -> anyhow::Result<()> {
        emit_on_commit(
            ctx.client,
            Arc::clone(&self.emitter),
            ctx.tenant.as_str(),
            &self.event,
            &entry,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fieldops_auth::{Identity, Role};
    use fieldops_core::{Tenant, UserId};
    use fieldops_events::{
        BusError, MUTATION_EVENT, Pipe, Subscriber, Subscription, Topic,
    };

    use super::*;
    use crate::hooks::{CaptureHook, MutationChain};
    use crate::store::{Database, InMemoryDatabase, Mutation, Transaction};

    async fn assert_silent(sub: &mut Box<dyn Subscription>) {
        let next = tokio::time::timeout(Duration::from_millis(20), sub.receive()).await;
        assert!(next.is_err(), "no message expected, got {next:?}");
    }

    fn capture_chain(pipe: &Pipe) -> MutationChain {
        let emitter: Arc<dyn Emitter> = Arc::new(pipe.emitter());
        MutationChain::new([CaptureHook::hook(Arc::new(EmitOnCommit::new(
            emitter,
            MUTATION_EVENT,
        )))])
    }

    #[tokio::test]
    async fn emits_immediately_without_transaction() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();
        let db = InMemoryDatabase::new();

        emit_on_commit(&db, Arc::new(pipe.emitter()), "acme", "ping", &serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let msg = sub.receive().await.unwrap();
        assert_eq!(msg.tenant(), Some("acme"));
        assert_eq!(msg.name(), Some("ping"));
        assert_eq!(msg.body, br#"{"n":1}"#);
    }

    #[tokio::test]
    async fn committed_mutation_is_published_after_commit() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();
        let chain = capture_chain(&pipe);
        let db = InMemoryDatabase::new();
        let tenant = Tenant::parse("acme").unwrap();
        let actor = Identity::user(tenant.clone(), UserId::new(1), "ops@acme.test", Role::USER);

        let tx = db.begin().await.unwrap();
        let ctx = MutationContext {
            tenant: &tenant,
            actor: Some(&actor),
            client: tx.as_client(),
        };
        chain.mutate(&ctx, &Mutation::create("WorkOrder")).await.unwrap();

        assert_silent(&mut sub).await;
        tx.commit().await.unwrap();

        let msg = sub.receive().await.unwrap();
        assert_eq!(msg.tenant(), Some("acme"));
        assert_eq!(msg.name(), Some(MUTATION_EVENT));
        let entry = LogEntry::decode(&msg.body).unwrap();
        assert_eq!(entry.actor_name, "ops@acme.test");
    }

    #[tokio::test]
    async fn rolled_back_mutation_is_never_published() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();
        let chain = capture_chain(&pipe);
        let db = InMemoryDatabase::new();
        let tenant = Tenant::parse("acme").unwrap();
        let actor = Identity::user(tenant.clone(), UserId::new(1), "ops@acme.test", Role::USER);

        let tx = db.begin().await.unwrap();
        let ctx = MutationContext {
            tenant: &tenant,
            actor: Some(&actor),
            client: tx.as_client(),
        };
        chain.mutate(&ctx, &Mutation::create("WorkOrder")).await.unwrap();
        tx.rollback().await.unwrap();

        assert_silent(&mut sub).await;
        assert_eq!(db.node_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_the_write() {
        let pipe = Pipe::new();
        pipe.shutdown().await.unwrap();
        let chain = capture_chain(&pipe);
        let db = InMemoryDatabase::new();
        let tenant = Tenant::parse("acme").unwrap();
        let actor = Identity::user(tenant.clone(), UserId::new(1), "ops@acme.test", Role::USER);
        let ctx = MutationContext {
            tenant: &tenant,
            actor: Some(&actor),
            client: &db,
        };

        chain.mutate(&ctx, &Mutation::create("WorkOrder")).await.unwrap();

        assert_eq!(db.node_count(), 1);
        assert!(matches!(pipe.subscribe().await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn registering_on_a_finished_transaction_fails() {
        let pipe = Pipe::new();
        let db = InMemoryDatabase::new();
        let tx = db.begin().await.unwrap();
        tx.commit().await.unwrap();

        let err = emit_on_commit(tx.as_client(), Arc::new(pipe.emitter()), "acme", "ping", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TxClosed));
    }
}
