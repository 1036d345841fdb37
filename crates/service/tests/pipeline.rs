//! End-to-end: capture hook → deferred emission → in-process topic → listener
//! → tenant event processor → change history.

use std::sync::Arc;
use std::time::Duration;

use fieldops_auth::{Identity, Role};
use fieldops_core::{NodeId, Tenant, UserId};
use fieldops_events::{Edge, Emitter, Field, ListenerStats, MUTATION_EVENT};
use fieldops_infra::handlers::TriggerRegistry;
use fieldops_infra::hooks::{CaptureHook, EmitOnCommit, MutationChain, MutationContext};
use fieldops_infra::store::{ChangedField, Client, Database, InMemoryDatabase, Mutation};
use fieldops_infra::{InMemoryTenancy, Topics};
use fieldops_service::ServiceConfig;
use fieldops_service::app::{build_listener, build_processor, run_listener};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BUS: &str = "mem://events";

struct Harness {
    tenant: Tenant,
    actor: Identity,
    db: InMemoryDatabase,
    chain: MutationChain,
    topics: Topics,
    stats: Arc<ListenerStats>,
    token: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

fn config(tenant_filter: Option<&str>) -> ServiceConfig {
    let mut config = ServiceConfig::from_lookup(|_| None).unwrap();
    config.bus_url = BUS.to_string();
    config.features = vec!["work_order_activities".to_string()];
    config.tenant = tenant_filter.map(str::to_string);
    config
}

async fn start(tenant_filter: Option<&str>) -> Harness {
    let tenant = Tenant::parse("acme").unwrap();
    let tenancy = Arc::new(InMemoryTenancy::new());
    let db = tenancy.database(&tenant).unwrap();
    let topics = Topics::new();
    let config = config(tenant_filter);

    let processor = build_processor(&config, tenancy, Arc::new(TriggerRegistry::new()));
    let listener = build_listener(&config, &topics, processor).await.unwrap();
    let stats = listener.stats();
    let token = CancellationToken::new();
    let task = tokio::spawn(run_listener(listener, token.clone()));

    let emitter = topics.open_emitter(BUS).unwrap();
    let chain = MutationChain::new([CaptureHook::hook(Arc::new(EmitOnCommit::new(
        emitter,
        MUTATION_EVENT,
    )))]);
    let actor = Identity::user(tenant.clone(), UserId::new(7), "ops@acme.test", Role::ADMIN);

    Harness {
        tenant,
        actor,
        db,
        chain,
        topics,
        stats,
        token,
        task,
    }
}

impl Harness {
    async fn commit(&self, mutation: Mutation) -> NodeId {
        let tx = self.db.begin().await.unwrap();
        let ctx = MutationContext {
            tenant: &self.tenant,
            actor: Some(&self.actor),
            client: tx.as_client(),
        };
        let outcome = self.chain.mutate(&ctx, &mutation).await.unwrap();
        tx.commit().await.unwrap();
        outcome.id().unwrap()
    }

    async fn rolled_back(&self, mutation: Mutation) {
        let tx = self.db.begin().await.unwrap();
        let ctx = MutationContext {
            tenant: &self.tenant,
            actor: Some(&self.actor),
            client: tx.as_client(),
        };
        self.chain.mutate(&ctx, &mutation).await.unwrap();
        tx.rollback().await.unwrap();
    }

    async fn wait_until(&self, what: &str, done: impl Fn(&Arc<ListenerStats>) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&self.stats) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}: {:?}", self.stats.snapshot());
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.token.cancel();
        self.task.await.unwrap()
    }
}

fn new_work_order() -> Mutation {
    Mutation::create("WorkOrder")
        .with_field(Field::new("creation_date", "time", 1_700_000_000))
        .with_field(Field::new("status", "string", "PLANNED"))
        .with_field(Field::new("priority", "string", "HIGH"))
        .with_edge(Edge::new("assignee", "User", vec![NodeId::new(11)]))
        .with_edge(Edge::new("owner", "User", vec![NodeId::new(7)]))
}

#[tokio::test]
async fn committed_mutations_become_change_history() {
    let harness = start(None).await;

    let id = harness.commit(new_work_order()).await;
    harness.wait_until("create", |s| s.snapshot().handled == 1).await;

    let created = harness.db.activities(id).await.unwrap();
    assert_eq!(created.len(), 5);
    assert!(created.iter().all(|a| a.is_create && a.old_value.is_none()));
    assert_eq!(created[0].changed_field, ChangedField::CreationDate);
    assert_eq!(created[0].new_value.as_deref(), Some("1700000000"));
    assert!(created.iter().all(|a| a.author_id == Some(UserId::new(7))));

    harness
        .commit(
            Mutation::update_one("WorkOrder", id)
                .with_field(Field::new("status", "string", "DONE"))
                .with_edge(Edge::new("assignee", "User", vec![NodeId::new(12)])),
        )
        .await;
    harness.wait_until("update", |s| s.snapshot().handled == 2).await;

    let history = harness.db.activities(id).await.unwrap();
    let updates: Vec<_> = history.iter().filter(|a| !a.is_create).collect();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].changed_field, ChangedField::Assignee);
    assert_eq!(updates[0].old_value.as_deref(), Some("11"));
    assert_eq!(updates[0].new_value.as_deref(), Some("12"));
    assert_eq!(updates[1].changed_field, ChangedField::Status);
    assert_eq!(updates[1].old_value.as_deref(), Some("PLANNED"));
    assert_eq!(updates[1].new_value.as_deref(), Some("DONE"));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn rolled_back_mutations_are_never_observed() {
    let harness = start(None).await;

    harness.rolled_back(new_work_order()).await;
    let id = harness.commit(new_work_order()).await;
    harness.wait_until("committed create", |s| s.snapshot().handled == 1).await;

    let snapshot = harness.stats.snapshot();
    assert_eq!(snapshot.received, 1);
    assert_eq!(harness.db.activities(id).await.unwrap().len(), 5);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn other_tenants_are_filtered_out() {
    let harness = start(Some("globex")).await;

    let id = harness.commit(new_work_order()).await;
    harness.wait_until("drop", |s| s.snapshot().dropped == 1).await;

    assert_eq!(harness.stats.snapshot().handled, 0);
    assert!(harness.db.activities(id).await.unwrap().is_empty());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_payload_stops_the_listener() {
    let harness = start(None).await;

    let emitter = harness.topics.open_emitter(BUS).unwrap();
    emitter
        .emit("acme", MUTATION_EVENT, b"not an entry".to_vec())
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap();
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("acme"));
    assert!(!harness.stats.is_running());
    assert_eq!(harness.stats.snapshot().failed, 1);
}
