#[macro_use]
extern crate log;

use std::sync::Arc;

use ack_runtime::{
    cache::Caches,
    config::Config,
    errors::ControllerError,
    metrics::Metrics,
    prometheus_exporter::{init_prometheus_exporter, start_prometheus_metrics_server},
    reconciler::RuntimeContext,
    registry::Registry,
    service_controller::ServiceController,
    services::{
        bookstore::{
            self, BookManagerFactory,
            sdk::{BookstoreApi, MemoryBookstore},
        },
        elasticache::{
            self,
            sdk::{ElastiCacheApi, MemoryElastiCache},
        },
    },
    session::Session,
};
use ack_runtime_apis::AwsAccountId;
use futures::future::join;
use kube::Client;

/// Registry of the bookstore service, served by an in-memory backend.
fn bookstore_registry(config: &Config, metrics: &Arc<Metrics>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    let factory = BookManagerFactory::new(
        Box::new(
            |session: &Session, account_id: &AwsAccountId| -> Result<Arc<dyn BookstoreApi>, ControllerError> {
                info!("connecting to bookstore in {} for account {}", session.region, account_id);
                Ok(Arc::new(MemoryBookstore::new(session.region.clone(), account_id.clone())))
            },
        ),
        config.resource_tags.clone(),
        metrics.clone(),
    );
    bookstore::register(&registry, Arc::new(factory));
    registry
}

fn elasticache_registry(metrics: &Arc<Metrics>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    elasticache::register(
        &registry,
        Arc::new(
            |session: &Session, account_id: &AwsAccountId| -> Result<Arc<dyn ElastiCacheApi>, ControllerError> {
                info!("connecting to elasticache in {} for account {}", session.region, account_id);
                Ok(Arc::new(MemoryElastiCache::new(session.region.clone(), account_id.clone())))
            },
        ),
        metrics.clone(),
    );
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = Config::from_env()?;
    config.validate()?;
    info!(
        "starting in account {} and region {}, development logging: {}, leader election: {}",
        config.account_id, config.region, config.enable_development_logging, config.enable_leader_election
    );

    let registry = init_prometheus_exporter()?;
    let metrics_server = start_prometheus_metrics_server(config.metrics_addr, registry);
    let metrics = Arc::new(Metrics::new());

    let client = Client::try_default().await?;
    let caches = Arc::new(Caches::new(config.controller_namespace.as_str()));
    caches.run(client.clone());
    let runtime = RuntimeContext {
        config: Arc::new(config.clone()),
        caches: caches.clone(),
        metrics: metrics.clone(),
    };

    let bookstore = ServiceController::new(
        bookstore::SERVICE_ALIAS,
        bookstore::API_GROUP,
        bookstore_registry(&config, &metrics),
    );
    let elasticache = ServiceController::new(
        elasticache::SERVICE_ALIAS,
        elasticache::API_GROUP,
        elasticache_registry(&metrics),
    );
    let controllers = join(
        bookstore.bind_controller_manager(client.clone(), runtime.clone())?,
        elasticache.bind_controller_manager(client, runtime)?,
    );

    info!("start controllers ...");
    tokio::select! {
        _ = controllers => (),
        r = metrics_server => r?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    };
    caches.stop();
    Ok(())
}
