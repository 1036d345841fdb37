//! Wiring of the `fieldops-async` process.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldops_auth::{FeatureSet, RolePermissionResolver};
use fieldops_events::{Listener, ListenerConfig, ListenerError, MUTATION_EVENT};
use fieldops_infra::handlers::{AuditLog, ChangeHistory, RuleTriggers, TriggerRegistry};
use fieldops_infra::{EventProcessor, InMemoryTenancy, PostgresTenancy, Tenancy, Topics};

use crate::config::ServiceConfig;
use crate::health;
use crate::orchestrator::TaskGroup;

/// Tenancy backing the processor: Postgres when a database URL is set.
pub fn build_tenancy(config: &ServiceConfig) -> Arc<dyn Tenancy> {
    match &config.database_url {
        Some(url) => Arc::new(PostgresTenancy::new(url.clone()).with_schema_bootstrap(true)),
        None => {
            warn!("no database configured; tenant data is kept in memory");
            Arc::new(InMemoryTenancy::new())
        }
    }
}

/// Processor running the audit log, change history and rule triggers, in
/// that order.
pub fn build_processor(
    config: &ServiceConfig,
    tenancy: Arc<dyn Tenancy>,
    triggers: Arc<TriggerRegistry>,
) -> EventProcessor {
    EventProcessor::new(tenancy, Arc::new(RolePermissionResolver::default()))
        .with_features(FeatureSet::new(config.features.iter().cloned()))
        .with_handler(Arc::new(AuditLog))
        .with_handler(Arc::new(ChangeHistory))
        .with_handler(Arc::new(RuleTriggers::new(triggers)))
}

pub async fn build_listener(
    config: &ServiceConfig,
    topics: &Topics,
    processor: EventProcessor,
) -> anyhow::Result<Listener> {
    let subscriber = topics
        .open_subscriber(&config.bus_url)
        .with_context(|| format!("opening subscriber for {}", config.bus_url))?;

    let listener = Listener::new(ListenerConfig {
        subscriber,
        handler: Arc::new(processor),
        events: vec![MUTATION_EVENT.to_string()],
        tenant: config.tenant.clone(),
    })
    .await?;
    Ok(listener)
}

/// Drive `listener` until it fails or `token` is cancelled, then close its
/// subscription. Cancellation is a clean stop.
pub async fn run_listener(mut listener: Listener, token: CancellationToken) -> anyhow::Result<()> {
    let result = listener.listen(&token).await;
    if let Err(err) = listener.shutdown().await {
        warn!(error = %err, "closing listener subscription");
    }
    match result {
        Ok(()) | Err(ListenerError::Cancelled) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Run the listener and health server until a signal arrives or either of
/// them stops.
pub async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    let topics = Topics::new();
    let tenancy = build_tenancy(&config);
    let processor = build_processor(&config, tenancy, Arc::new(TriggerRegistry::new()));
    info!(handlers = ?processor.handler_names(), bus = %config.bus_url, "starting event processor");

    let listener = build_listener(&config, &topics, processor).await?;
    let stats = listener.stats();

    let http = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;

    let mut group = TaskGroup::new();
    group.spawn_signal_handler();
    group.spawn("listener", run_listener(listener, group.token()));
    group.spawn(
        "health",
        health::serve(http, health::router(stats), group.token(), config.shutdown_grace),
    );

    group.wait().await?;
    info!("graceful shutdown complete");
    Ok(())
}
