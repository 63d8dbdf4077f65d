//! docdb-replicator - leader with in-memory followers
//!
//! This is the composition root that wires a leader storage engine, the
//! updates queue and the async replicator together.

use docdb_replication::adapters::outbound::{InMemoryClient, InMemoryClientFactory, InMemoryStorage};
use docdb_replication::config::load_config;
use docdb_replication::domain::entities::NamespaceDef;
use docdb_replication::infrastructure::shutdown_signal;
use docdb_replication::replication::{AsyncDataReplicator, UpdatesQueue};
use docdb_replication::ServerId;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting docdb-replicator server_id={} followers={}",
        cfg.server_id,
        cfg.follower_dsns.len()
    );

    // ===== COMPOSITION ROOT =====

    // 1. Leader storage feeding the updates queue
    let queue = Arc::new(UpdatesQueue::new(cfg.queue_capacity));
    let leader = Arc::new(InMemoryStorage::new(ServerId(cfg.server_id)));
    leader.attach_queue(queue.clone());

    // 2. In-memory followers reachable through their DSNs
    let factory = Arc::new(InMemoryClientFactory::new());
    let mut followers = Vec::with_capacity(cfg.follower_dsns.len());
    for (i, dsn) in cfg.follower_dsns.iter().enumerate() {
        let storage = Arc::new(InMemoryStorage::new(cfg.follower_server_id(i)));
        factory.register(dsn.clone(), Arc::new(InMemoryClient::new(storage.clone())));
        followers.push((dsn.clone(), storage));
    }

    // 3. Async replicator
    let replicator = Arc::new(AsyncDataReplicator::new(
        ServerId(cfg.server_id),
        leader.clone(),
        queue,
        factory,
    ));
    replicator.configure(cfg.async_repl_config())?;
    replicator.run()?;

    // 4. Demo workload
    leader.create_namespace(NamespaceDef::new(cfg.demo_namespace.clone()))?;
    for i in 0..cfg.demo_items {
        leader.upsert_item(&cfg.demo_namespace, &format!(r#"{{"id":{}}}"#, i))?;
    }
    tracing::info!(
        "wrote {} items into {}, waiting for shutdown signal",
        cfg.demo_items,
        cfg.demo_namespace
    );

    shutdown_signal().await;

    let stats = replicator.get_replication_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for (dsn, storage) in &followers {
        let items = storage.items(&cfg.demo_namespace).map(|i| i.len()).unwrap_or(0);
        tracing::info!("{}: {} items replicated", dsn, items);
    }

    // Threads are joined synchronously
    tokio::task::spawn_blocking(move || replicator.stop(true)).await?;
    tracing::info!("docdb-replicator stopped");
    Ok(())
}
