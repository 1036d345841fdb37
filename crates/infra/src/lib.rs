//! Infrastructure layer: tenant stores, mutation hooks, bus backends and the
//! tenant event processor.

pub mod event_bus;
pub mod handlers;
pub mod hooks;
pub mod processor;
pub mod store;
pub mod tenancy;

pub use event_bus::{TopicUrl, Topics};
pub use processor::{EventProcessor, ProcessError, SERVICE_NAME};
pub use tenancy::{InMemoryTenancy, PostgresTenancy, Tenancy, TenancyError};
