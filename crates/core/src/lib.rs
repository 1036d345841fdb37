//! `fieldops-core`: identifiers and error primitives shared by every crate.
//!
//! This crate contains no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{NodeId, Tenant, UserId};
