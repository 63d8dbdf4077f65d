use crate::domain::value_objects::ServerId;
use crate::replication::{AsyncNodeConfig, AsyncReplConfig, ReplThreadConfig};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Local node
    pub server_id: i32,
    pub debug: bool,

    // Followers and replicated namespaces
    pub follower_dsns: Vec<String>,
    pub namespaces: Vec<String>,
    pub threads_count: usize,
    pub queue_capacity: usize,

    // Replication thread knobs
    pub app_name: String,
    pub updates_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub retry_sync_interval_ms: u64,
    pub parallel_syncs: usize,
    pub batching_routines: usize,
    pub max_wal_depth: i64,
    pub compression: bool,

    // Demo workload written by the binary
    pub demo_namespace: String,
    pub demo_items: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: 1,
            debug: false,
            follower_dsns: vec!["mem://follower-1".to_string(), "mem://follower-2".to_string()],
            namespaces: Vec::new(),
            threads_count: 0,
            queue_capacity: 10_000,
            app_name: "docdb_replicator".to_string(),
            updates_timeout_secs: 20,
            sync_timeout_secs: 60,
            retry_sync_interval_ms: 3000,
            parallel_syncs: 2,
            batching_routines: 100,
            max_wal_depth: 1000,
            compression: false,
            demo_namespace: "items".to_string(),
            demo_items: 100,
        }
    }
}

impl Config {
    /// Thread knobs derived from the loaded settings.
    pub fn thread_config(&self) -> ReplThreadConfig {
        ReplThreadConfig::default()
            .app_name(self.app_name.clone())
            .timeouts(
                Duration::from_secs(self.updates_timeout_secs),
                Duration::from_secs(self.sync_timeout_secs),
            )
            .retry_sync_interval(Duration::from_millis(self.retry_sync_interval_ms))
            .parallel_syncs_per_thread(self.parallel_syncs)
            .batching_routines_count(self.batching_routines)
            .max_wal_depth_on_force_sync(self.max_wal_depth)
            .compression(self.compression)
    }

    /// Leader config with one follower per DSN. Follower server ids follow
    /// the local one.
    pub fn async_repl_config(&self) -> AsyncReplConfig {
        let nodes = self
            .follower_dsns
            .iter()
            .enumerate()
            .map(|(i, dsn)| AsyncNodeConfig::new(self.follower_server_id(i), dsn.clone()))
            .collect();
        AsyncReplConfig::leader(nodes)
            .namespaces(self.namespaces.clone())
            .threads_count(self.threads_count)
            .thread(self.thread_config())
    }

    pub fn follower_server_id(&self, index: usize) -> ServerId {
        ServerId(self.server_id + 1 + index as i32)
    }
}

fn list_var(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn flag_var(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let server_id: i32 = match std::env::var("DOCREPL_SERVER_ID") {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid DOCREPL_SERVER_ID {:?}: {}", v, e))?,
        Err(_) => defaults.server_id,
    };
    if server_id < 0 {
        anyhow::bail!("DOCREPL_SERVER_ID must not be negative");
    }

    let debug = std::env::var("DEBUG").is_ok();

    let follower_dsns = list_var("DOCREPL_FOLLOWERS").unwrap_or(defaults.follower_dsns);
    let namespaces = list_var("DOCREPL_NAMESPACES").unwrap_or_default();

    let threads_count = std::env::var("DOCREPL_THREADS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(defaults.threads_count);

    let queue_capacity = std::env::var("DOCREPL_QUEUE_CAPACITY")
        .unwrap_or_else(|_| "10000".to_string())
        .parse()
        .unwrap_or(defaults.queue_capacity);

    let app_name = std::env::var("DOCREPL_APP_NAME").unwrap_or(defaults.app_name);

    let updates_timeout_secs = std::env::var("DOCREPL_UPDATES_TIMEOUT_SECS")
        .unwrap_or_else(|_| "20".to_string())
        .parse()
        .unwrap_or(defaults.updates_timeout_secs);

    let sync_timeout_secs = std::env::var("DOCREPL_SYNC_TIMEOUT_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(defaults.sync_timeout_secs);

    let retry_sync_interval_ms = std::env::var("DOCREPL_RETRY_SYNC_INTERVAL_MS")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .unwrap_or(defaults.retry_sync_interval_ms);

    let parallel_syncs = std::env::var("DOCREPL_PARALLEL_SYNCS")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .unwrap_or(defaults.parallel_syncs);

    let batching_routines = std::env::var("DOCREPL_BATCHING_ROUTINES")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(defaults.batching_routines);

    let max_wal_depth = std::env::var("DOCREPL_MAX_WAL_DEPTH")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()
        .unwrap_or(defaults.max_wal_depth);

    let compression = flag_var("DOCREPL_COMPRESSION");

    let demo_namespace = std::env::var("DOCREPL_DEMO_NAMESPACE").unwrap_or(defaults.demo_namespace);

    let demo_items = std::env::var("DOCREPL_DEMO_ITEMS")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(defaults.demo_items);

    let cfg = Config {
        server_id,
        debug,
        follower_dsns,
        namespaces,
        threads_count,
        queue_capacity,
        app_name,
        updates_timeout_secs,
        sync_timeout_secs,
        retry_sync_interval_ms,
        parallel_syncs,
        batching_routines,
        max_wal_depth,
        compression,
        demo_namespace,
        demo_items,
    };
    cfg.async_repl_config()
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid replication config: {}", e))?;
    Ok(cfg)
}
