use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use fieldops_core::NodeId;
use fieldops_events::{Node, Op};

use super::r#trait::{
    Activity, Client, CommitHook, Database, Mutation, MutationOutcome, NewActivity, StoreError,
    Transaction, run_hooks,
};

/// Id counters shared by every transaction. Like database sequences they are
/// not rolled back, so ids burned by an aborted transaction are never reused.
#[derive(Debug, Default)]
struct Sequences {
    node: AtomicI64,
    activity: AtomicI64,
}

impl Sequences {
    fn next_node(&self) -> NodeId {
        NodeId::new(self.node.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn next_activity(&self) -> i64 {
        self.activity.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Node access shared by committed data and a transaction's staged view.
trait Nodes {
    fn get(&self, id: NodeId) -> Option<Node>;
    fn put(&mut self, node: Node);
    fn remove(&mut self, id: NodeId);

    fn typed(&self, node_type: &str, id: NodeId) -> Option<Node> {
        self.get(id).filter(|n| n.kind == node_type)
    }
}

fn apply(
    nodes: &mut impl Nodes,
    seq: &Sequences,
    mutation: &Mutation,
) -> Result<MutationOutcome, StoreError> {
    mutation.validate()?;

    match mutation.op {
        Op::Create => {
            let id = seq.next_node();
            let mut node = Node::new(id, mutation.node_type.clone());
            mutation.patch(&mut node);
            nodes.put(node);
            Ok(MutationOutcome::new(vec![id]))
        }
        Op::UpdateOne | Op::Update => {
            let mut touched = Vec::new();
            for &id in &mutation.ids {
                match nodes.typed(&mutation.node_type, id) {
                    Some(mut node) => {
                        mutation.patch(&mut node);
                        nodes.put(node);
                        touched.push(id);
                    }
                    None if mutation.op == Op::UpdateOne => return Err(StoreError::NotFound(id)),
                    None => {}
                }
            }
            Ok(MutationOutcome::new(touched))
        }
        Op::DeleteOne | Op::Delete => {
            let mut touched = Vec::new();
            for &id in &mutation.ids {
                if nodes.typed(&mutation.node_type, id).is_some() {
                    nodes.remove(id);
                    touched.push(id);
                } else if mutation.op == Op::DeleteOne {
                    return Err(StoreError::NotFound(id));
                }
            }
            Ok(MutationOutcome::new(touched))
        }
    }
}

fn new_activity(seq: &Sequences, new: NewActivity) -> Activity {
    Activity::from_new(seq.next_activity(), new, Utc::now())
}

fn activities_of<'a>(
    activities: impl Iterator<Item = &'a Activity>,
    work_order: NodeId,
) -> Vec<Activity> {
    activities
        .filter(|a| a.work_order_id == work_order)
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
struct Data {
    nodes: BTreeMap<NodeId, Node>,
    activities: Vec<Activity>,
}

impl Nodes for Data {
    fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }

    fn put(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    fn remove(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }
}

/// Writes of an open transaction, replayed onto [`Data`] at commit.
#[derive(Debug, Default)]
struct WriteSet {
    /// Latest staged version of each touched node; `None` marks a deletion.
    nodes: BTreeMap<NodeId, Option<Node>>,
    activities: Vec<Activity>,
}

impl WriteSet {
    fn replay(self, data: &mut Data) {
        for (id, node) in self.nodes {
            match node {
                Some(node) => data.put(node),
                None => data.remove(id),
            }
        }
        data.activities.extend(self.activities);
    }
}

/// Committed data seen through a transaction's pending writes.
struct Staged<'a> {
    committed: &'a Data,
    writes: &'a mut WriteSet,
}

impl Nodes for Staged<'_> {
    fn get(&self, id: NodeId) -> Option<Node> {
        match self.writes.nodes.get(&id) {
            Some(staged) => staged.clone(),
            None => self.committed.get(id),
        }
    }

    fn put(&mut self, node: Node) {
        self.writes.nodes.insert(node.id, Some(node));
    }

    fn remove(&mut self, id: NodeId) {
        self.writes.nodes.insert(id, None);
    }
}

fn poisoned() -> StoreError {
    StoreError::Database("lock poisoned".to_string())
}

/// In-memory tenant database.
///
/// Intended for tests/dev. A transaction reads committed data through its own
/// pending writes and replays only those writes on commit, so work committed
/// by others in the meantime is kept. Two transactions writing the same node
/// resolve last-commit-wins.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    data: Arc<RwLock<Data>>,
    seq: Arc<Sequences>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes currently stored.
    pub fn node_count(&self) -> usize {
        self.data.read().map(|d| d.nodes.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Client for InMemoryDatabase {
    async fn node(&self, id: NodeId) -> Result<Node, StoreError> {
        self.data
            .read()
            .map_err(|_| poisoned())?
            .get(id)
            .ok_or(StoreError::NotFound(id))
    }

    async fn apply(&self, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
        let mut data = self.data.write().map_err(|_| poisoned())?;
        apply(&mut *data, &self.seq, mutation)
    }

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, StoreError> {
        let activity = new_activity(&self.seq, activity);
        self.data
            .write()
            .map_err(|_| poisoned())?
            .activities
            .push(activity.clone());
        Ok(activity)
    }

    async fn activities(&self, work_order: NodeId) -> Result<Vec<Activity>, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(activities_of(data.activities.iter(), work_order))
    }

    async fn on_commit(&self, hook: CommitHook) -> Result<(), StoreError> {
        hook().await;
        Ok(())
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.data),
            seq: Arc::clone(&self.seq),
            state: Mutex::new(TxState {
                writes: Some(WriteSet::default()),
                hooks: Vec::new(),
            }),
        }))
    }

    fn as_client(&self) -> &dyn Client {
        self
    }
}

#[derive(Default)]
struct TxState {
    /// `None` once the transaction is finished.
    writes: Option<WriteSet>,
    hooks: Vec<CommitHook>,
}

/// Transaction over an [`InMemoryDatabase`].
pub struct InMemoryTransaction {
    shared: Arc<RwLock<Data>>,
    seq: Arc<Sequences>,
    state: Mutex<TxState>,
}

impl InMemoryTransaction {
    fn with_staged<R>(
        &self,
        f: impl FnOnce(&mut Staged<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let writes = state.writes.as_mut().ok_or(StoreError::TxClosed)?;
        let committed = self.shared.read().map_err(|_| poisoned())?;
        f(&mut Staged {
            committed: &*committed,
            writes,
        })
    }
}

#[async_trait]
impl Client for InMemoryTransaction {
    async fn node(&self, id: NodeId) -> Result<Node, StoreError> {
        self.with_staged(|staged| staged.get(id).ok_or(StoreError::NotFound(id)))
    }

    async fn apply(&self, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
        self.with_staged(|staged| apply(staged, &self.seq, mutation))
    }

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, StoreError> {
        self.with_staged(|staged| {
            let activity = new_activity(&self.seq, activity);
            staged.writes.activities.push(activity.clone());
            Ok(activity)
        })
    }

    async fn activities(&self, work_order: NodeId) -> Result<Vec<Activity>, StoreError> {
        self.with_staged(|staged| {
            let all = staged
                .committed
                .activities
                .iter()
                .chain(staged.writes.activities.iter());
            Ok(activities_of(all, work_order))
        })
    }

    async fn on_commit(&self, hook: CommitHook) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.writes.is_none() {
            return Err(StoreError::TxClosed);
        }
        state.hooks.push(hook);
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(&self) -> Result<(), StoreError> {
        let hooks = {
            let mut state = self.state.lock().map_err(|_| poisoned())?;
            let writes = state.writes.take().ok_or(StoreError::TxClosed)?;
            writes.replay(&mut *self.shared.write().map_err(|_| poisoned())?);
            std::mem::take(&mut state.hooks)
        };
        run_hooks(hooks).await;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.writes.take().ok_or(StoreError::TxClosed)?;
        state.hooks.clear();
        Ok(())
    }

    fn as_client(&self) -> &dyn Client {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fieldops_events::{Edge, Field};
    use futures::FutureExt;

    use super::*;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> CommitHook {
        let counter = Arc::clone(counter);
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn create_work_order() -> Mutation {
        Mutation::create("WorkOrder")
            .with_field(Field::new("status", "string", "PLANNED"))
            .with_edge(Edge::new("owner", "User", vec![NodeId::new(7)]))
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids() {
        let db = InMemoryDatabase::new();
        let a = db.apply(&create_work_order()).await.unwrap();
        let b = db.apply(&create_work_order()).await.unwrap();

        assert_eq!(a.id(), Some(NodeId::new(1)));
        assert_eq!(b.id(), Some(NodeId::new(2)));
        let node = db.node(NodeId::new(1)).await.unwrap();
        assert_eq!(node.string_field("status").as_deref(), Some("PLANNED"));
        assert_eq!(node.first_edge_id("owner"), Some(NodeId::new(7)));
    }

    #[tokio::test]
    async fn update_one_patches_and_clears_edges() {
        let db = InMemoryDatabase::new();
        let id = db.apply(&create_work_order()).await.unwrap().id().unwrap();

        db.apply(
            &Mutation::update_one("WorkOrder", id)
                .with_field(Field::new("status", "string", "DONE"))
                .with_edge(Edge::new("owner", "User", vec![])),
        )
        .await
        .unwrap();

        let node = db.node(id).await.unwrap();
        assert_eq!(node.string_field("status").as_deref(), Some("DONE"));
        assert!(node.edge("owner").is_none());
    }

    #[tokio::test]
    async fn single_row_ops_require_an_existing_target() {
        let db = InMemoryDatabase::new();
        let missing = NodeId::new(42);

        assert!(db.apply(&Mutation::update_one("WorkOrder", missing)).await.unwrap_err().is_not_found());
        assert!(db.apply(&Mutation::delete_one("WorkOrder", missing)).await.unwrap_err().is_not_found());

        let bulk = db.apply(&Mutation::delete("WorkOrder", vec![missing])).await.unwrap();
        assert_eq!(bulk.affected, 0);
    }

    #[tokio::test]
    async fn invalid_id_sets_are_rejected() {
        let db = InMemoryDatabase::new();
        let mut m = Mutation::update_one("WorkOrder", NodeId::new(1));
        m.ids.push(NodeId::new(2));
        assert!(matches!(db.apply(&m).await, Err(StoreError::InvalidMutation(_))));
    }

    #[tokio::test]
    async fn committed_writes_become_visible_and_run_hooks() {
        let db = InMemoryDatabase::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let tx = db.begin().await.unwrap();
        let id = tx.apply(&create_work_order()).await.unwrap().id().unwrap();
        tx.on_commit(counting_hook(&fired)).await.unwrap();

        assert!(db.node(id).await.is_err(), "uncommitted write must stay private");
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tx.commit().await.unwrap();

        assert!(db.node(id).await.is_ok());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_hooks() {
        let db = InMemoryDatabase::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let tx = db.begin().await.unwrap();
        tx.apply(&create_work_order()).await.unwrap();
        tx.on_commit(counting_hook(&fired)).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(db.node_count(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finished_transaction_rejects_further_use() {
        let db = InMemoryDatabase::new();
        let tx = db.begin().await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(tx.commit().await, Err(StoreError::TxClosed)));
        assert!(matches!(tx.rollback().await, Err(StoreError::TxClosed)));
        assert!(matches!(tx.node(NodeId::new(1)).await, Err(StoreError::TxClosed)));
    }

    #[tokio::test]
    async fn on_commit_without_transaction_runs_immediately() {
        let db = InMemoryDatabase::new();
        let fired = Arc::new(AtomicUsize::new(0));
        db.on_commit(counting_hook(&fired)).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commit_keeps_writes_committed_while_open() {
        let db = InMemoryDatabase::new();
        let id = db.apply(&create_work_order()).await.unwrap().id().unwrap();

        let tx = db.begin().await.unwrap();
        db.apply(
            &Mutation::update_one("WorkOrder", id).with_field(Field::new("status", "string", "DONE")),
        )
        .await
        .unwrap();
        let staged = tx.apply(&create_work_order()).await.unwrap().id().unwrap();
        tx.commit().await.unwrap();

        let node = db.node(id).await.unwrap();
        assert_eq!(node.string_field("status").as_deref(), Some("DONE"));
        assert!(db.node(staged).await.is_ok());
        assert_eq!(db.node_count(), 2);
    }

    #[tokio::test]
    async fn overlapping_creates_get_distinct_ids() {
        let db = InMemoryDatabase::new();

        let tx = db.begin().await.unwrap();
        let inside = tx.apply(&create_work_order()).await.unwrap().id().unwrap();
        let outside = db.apply(&create_work_order()).await.unwrap().id().unwrap();
        tx.commit().await.unwrap();

        assert_ne!(inside, outside);
        assert_eq!(db.node_count(), 2);
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes_over_committed_data() {
        let db = InMemoryDatabase::new();
        let id = db.apply(&create_work_order()).await.unwrap().id().unwrap();

        let tx = db.begin().await.unwrap();
        tx.apply(&Mutation::delete_one("WorkOrder", id)).await.unwrap();

        assert!(tx.node(id).await.unwrap_err().is_not_found());
        assert!(db.node(id).await.is_ok());

        tx.commit().await.unwrap();
        assert_eq!(db.node_count(), 0);
    }
}
