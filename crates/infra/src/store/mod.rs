//! Tenant database boundary used by the mutation-capture pipeline.
//!
//! Covers the privileged snapshot read, raw writes, activity rows,
//! transactions and on-commit callbacks. Backends: in-memory (tests/dev) and
//! Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryDatabase, InMemoryTransaction};
pub use postgres::{PostgresDatabase, PostgresTransaction};
pub use r#trait::{
    Activity, ChangedField, Client, CommitHook, Database, Mutation, MutationOutcome, NewActivity,
    StoreError, Transaction,
};
