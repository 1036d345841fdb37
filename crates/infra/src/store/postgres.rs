//! Postgres-backed tenant database.
//!
//! Every tenant owns a whole database (see `tenancy::PostgresTenancy`), so
//! tables carry no tenant column.
//!
//! ## Schema
//!
//! - `nodes`: one row per entity; `fields` and `edges` are JSONB arrays shaped
//!   like the snapshot [`Node`], so a privileged snapshot read is one row fetch
//! - `activities`: append-only change history
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Database` with the operation name and server message |
//! | PoolClosed | `Database` |
//! | RowNotFound | `Database` (queries use `fetch_optional`) |
//! | Other | `Database` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use fieldops_core::{NodeId, UserId};
use fieldops_events::{Edge, Field, Node, Op};

use super::r#trait::{
    Activity, ChangedField, Client, CommitHook, Database, Mutation, MutationOutcome, NewActivity,
    StoreError, Transaction, run_hooks,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id BIGSERIAL PRIMARY KEY,
        type TEXT NOT NULL,
        fields JSONB NOT NULL DEFAULT '[]',
        edges JSONB NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activities (
        id BIGSERIAL PRIMARY KEY,
        changed_field TEXT NOT NULL,
        is_create BOOLEAN NOT NULL,
        old_value TEXT,
        new_value TEXT,
        author_id BIGINT,
        work_order_id BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS activities_work_order_idx ON activities (work_order_id)",
];

/// A tenant database reached through a connection pool.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the pipeline's tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }
}

#[async_trait]
impl Client for PostgresDatabase {
    async fn node(&self, id: NodeId) -> Result<Node, StoreError> {
        let mut conn = self.acquire().await?;
        load_node(&mut conn, id, false).await
    }

    async fn apply(&self, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
        // Multi-row patches read then write; keep them atomic.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let outcome = apply_mutation(&mut tx, mutation).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, StoreError> {
        let mut conn = self.acquire().await?;
        insert_activity(&mut conn, activity).await
    }

    async fn activities(&self, work_order: NodeId) -> Result<Vec<Activity>, StoreError> {
        let mut conn = self.acquire().await?;
        load_activities(&mut conn, work_order).await
    }

    async fn on_commit(&self, hook: CommitHook) -> Result<(), StoreError> {
        hook().await;
        Ok(())
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction {
            tx: AsyncMutex::new(Some(tx)),
            hooks: Mutex::new(Vec::new()),
        }))
    }

    fn as_client(&self) -> &dyn Client {
        self
    }
}

/// An open Postgres transaction.
///
/// Dropping it without `commit` rolls back (sqlx semantics).
pub struct PostgresTransaction {
    tx: AsyncMutex<Option<sqlx::Transaction<'static, Postgres>>>,
    hooks: Mutex<Vec<CommitHook>>,
}

fn poisoned() -> StoreError {
    StoreError::Database("lock poisoned".to_string())
}

#[async_trait]
impl Client for PostgresTransaction {
    async fn node(&self, id: NodeId) -> Result<Node, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxClosed)?;
        load_node(tx, id, false).await
    }

    async fn apply(&self, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxClosed)?;
        apply_mutation(tx, mutation).await
    }

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxClosed)?;
        insert_activity(tx, activity).await
    }

    async fn activities(&self, work_order: NodeId) -> Result<Vec<Activity>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxClosed)?;
        load_activities(tx, work_order).await
    }

    async fn on_commit(&self, hook: CommitHook) -> Result<(), StoreError> {
        if self.tx.lock().await.is_none() {
            return Err(StoreError::TxClosed);
        }
        self.hooks.lock().map_err(|_| poisoned())?.push(hook);
        Ok(())
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    #[instrument(skip(self), err)]
    async fn commit(&self) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::TxClosed)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        let hooks = std::mem::take(&mut *self.hooks.lock().map_err(|_| poisoned())?);
        run_hooks(hooks).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn rollback(&self) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::TxClosed)?;
        self.hooks.lock().map_err(|_| poisoned())?.clear();
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }

    fn as_client(&self) -> &dyn Client {
        self
    }
}

async fn load_node(conn: &mut PgConnection, id: NodeId, for_update: bool) -> Result<Node, StoreError> {
    let sql = if for_update {
        "SELECT id, type, fields, edges FROM nodes WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT id, type, fields, edges FROM nodes WHERE id = $1"
    };
    let row = sqlx::query(sql)
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_node", e))?
        .ok_or(StoreError::NotFound(id))?;
    node_from_row(&row)
}

async fn apply_mutation(conn: &mut PgConnection, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
    mutation.validate()?;

    match mutation.op {
        Op::Create => {
            let mut node = Node::new(NodeId::new(0), mutation.node_type.clone());
            mutation.patch(&mut node);
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO nodes (type, fields, edges) VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(&node.kind)
            .bind(Json(&node.fields))
            .bind(Json(&node.edges))
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("insert_node", e))?;
            Ok(MutationOutcome::new(vec![NodeId::new(id)]))
        }
        Op::UpdateOne | Op::Update => {
            let mut touched = Vec::with_capacity(mutation.ids.len());
            for &id in &mutation.ids {
                let mut node = match load_node(conn, id, true).await {
                    Ok(node) if node.kind == mutation.node_type => node,
                    Ok(_) | Err(StoreError::NotFound(_)) if mutation.op == Op::Update => continue,
                    Ok(_) => return Err(StoreError::NotFound(id)),
                    Err(e) => return Err(e),
                };
                mutation.patch(&mut node);
                sqlx::query("UPDATE nodes SET fields = $2, edges = $3 WHERE id = $1")
                    .bind(id.get())
                    .bind(Json(&node.fields))
                    .bind(Json(&node.edges))
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| map_sqlx_error("update_node", e))?;
                touched.push(id);
            }
            Ok(MutationOutcome::new(touched))
        }
        Op::DeleteOne | Op::Delete => {
            let ids: Vec<i64> = mutation.ids.iter().map(NodeId::get).collect();
            let deleted: Vec<i64> = sqlx::query_scalar(
                "DELETE FROM nodes WHERE id = ANY($1) AND type = $2 RETURNING id",
            )
            .bind(ids)
            .bind(&mutation.node_type)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("delete_nodes", e))?;

            if mutation.op == Op::DeleteOne && deleted.is_empty() {
                if let Some(id) = mutation.target() {
                    return Err(StoreError::NotFound(id));
                }
            }
            Ok(MutationOutcome::new(deleted.into_iter().map(NodeId::new).collect()))
        }
    }
}

async fn insert_activity(conn: &mut PgConnection, activity: NewActivity) -> Result<Activity, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO activities (
            changed_field,
            is_create,
            old_value,
            new_value,
            author_id,
            work_order_id
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, created_at
        "#,
    )
    .bind(activity.changed_field.as_str())
    .bind(activity.is_create)
    .bind(activity.old_value.as_deref())
    .bind(activity.new_value.as_deref())
    .bind(activity.author_id.map(|id| id.get()))
    .bind(activity.work_order_id.get())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_activity", e))?;

    let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("insert_activity", e))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| map_sqlx_error("insert_activity", e))?;
    Ok(Activity::from_new(id, activity, created_at))
}

async fn load_activities(conn: &mut PgConnection, work_order: NodeId) -> Result<Vec<Activity>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT
            id,
            changed_field,
            is_create,
            old_value,
            new_value,
            author_id,
            work_order_id,
            created_at
        FROM activities
        WHERE work_order_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(work_order.get())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_activities", e))?;

    rows.iter().map(activity_from_row).collect()
}

fn node_from_row(row: &PgRow) -> Result<Node, StoreError> {
    let decode = |e| map_sqlx_error("decode_node", e);
    let Json(fields): Json<Vec<Field>> = row.try_get("fields").map_err(decode)?;
    let Json(edges): Json<Vec<Edge>> = row.try_get("edges").map_err(decode)?;
    Ok(Node {
        id: NodeId::new(row.try_get("id").map_err(decode)?),
        kind: row.try_get("type").map_err(decode)?,
        fields,
        edges,
    })
}

fn activity_from_row(row: &PgRow) -> Result<Activity, StoreError> {
    let decode = |e| map_sqlx_error("decode_activity", e);
    let changed_field: String = row.try_get("changed_field").map_err(decode)?;
    let author_id: Option<i64> = row.try_get("author_id").map_err(decode)?;
    Ok(Activity {
        id: row.try_get("id").map_err(decode)?,
        changed_field: changed_field.parse::<ChangedField>()?,
        is_create: row.try_get("is_create").map_err(decode)?,
        old_value: row.try_get("old_value").map_err(decode)?,
        new_value: row.try_get("new_value").map_err(decode)?,
        author_id: author_id.map(UserId::new),
        work_order_id: NodeId::new(row.try_get("work_order_id").map_err(decode)?),
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Database(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Database(format!("unexpected row not found in {operation}"))
        }
        other => StoreError::Database(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_name_the_operation() {
        let err = map_sqlx_error("load_node", sqlx::Error::PoolClosed);
        assert!(err.to_string().contains("load_node"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn schema_creates_both_tables() {
        let ddl = SCHEMA.join("\n");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS nodes"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS activities"));
    }
}
