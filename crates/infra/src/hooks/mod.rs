//! Mutation chain: composable middleware around raw store writes.
//!
//! A [`MutationChain`] is built once from an ordered list of [`Hook`]s. The
//! first hook is the outermost wrapper; the innermost step applies the
//! mutation through the context's [`Client`].

pub mod capture;
pub mod emit;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use fieldops_auth::Identity;
use fieldops_core::Tenant;

use crate::store::{Client, Mutation, MutationOutcome, StoreError};

pub use capture::{CaptureHook, EntryHandler};
pub use emit::{EmitOnCommit, emit_on_commit};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The write went through but its capture handler failed.
    #[error("capturing mutation: {0}")]
    Capture(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Request-scoped context threaded through the chain.
#[derive(Clone, Copy)]
pub struct MutationContext<'a> {
    pub tenant: &'a Tenant,
    /// Identified actor; capture is skipped without one.
    pub actor: Option<&'a Identity>,
    /// Client (or open transaction) the mutation runs against.
    pub client: &'a dyn Client,
}

/// One step of the chain.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn mutate(
        &self,
        ctx: &MutationContext<'_>,
        mutation: &Mutation,
    ) -> Result<MutationOutcome, MutationError>;
}

/// Wraps the next step of the chain.
pub type Hook = Box<dyn Fn(Arc<dyn Mutator>) -> Arc<dyn Mutator> + Send + Sync>;

/// Innermost step: apply the write.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientMutator;

#[async_trait]
impl Mutator for ClientMutator {
    async fn mutate(
        &self,
        ctx: &MutationContext<'_>,
        mutation: &Mutation,
    ) -> Result<MutationOutcome, MutationError> {
        Ok(ctx.client.apply(mutation).await?)
    }
}

pub struct MutationChain {
    head: Arc<dyn Mutator>,
}

impl MutationChain {
    pub fn new(hooks: impl IntoIterator<Item = Hook>) -> Self {
        let hooks: Vec<Hook> = hooks.into_iter().collect();
        let mut head: Arc<dyn Mutator> = Arc::new(ClientMutator);
        for hook in hooks.iter().rev() {
            head = hook(head);
        }
        Self { head }
    }

    pub async fn mutate(
        &self,
        ctx: &MutationContext<'_>,
        mutation: &Mutation,
    ) -> Result<MutationOutcome, MutationError> {
        self.head.mutate(ctx, mutation).await
    }
}

impl Default for MutationChain {
    fn default() -> Self {
        Self::new(Vec::<Hook>::new())
    }
}
