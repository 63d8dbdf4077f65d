//! Replication Configuration
//!
//! Configuration for replication threads and the async replicator.

use crate::domain::ports::ClientConfig;
use crate::domain::value_objects::{NodeUid, ServerId};
use std::time::Duration;

/// Tuning knobs shared by every replication thread.
#[derive(Debug, Clone)]
pub struct ReplThreadConfig {
    /// Application name reported to followers (default: "docdb_replicator")
    pub app_name: String,

    /// Network timeout for live update calls (default: 20s)
    pub updates_timeout: Duration,

    /// Timeout for each call issued while syncing a namespace (default: 60s)
    pub sync_timeout: Duration,

    /// Delay before a failed node is retried (default: 3s)
    pub retry_sync_interval: Duration,

    /// Delay before retrying a node whose namespace is being copied (default: 2s)
    pub ns_copy_retry_interval: Duration,

    /// Granularity of backoff sleeps (default: 150ms)
    pub backoff_step: Duration,

    /// Pause between remote role checks (default: 150ms)
    pub role_switch_step: Duration,

    /// Attempts to observe the expected remote role (default: 50)
    pub max_role_switch_retries: usize,

    /// Namespace syncs allowed at once per thread, 0 for unlimited (default: 2)
    pub parallel_syncs_per_thread: usize,

    /// Batched updates in flight per node (default: 100)
    pub batching_routines_count: usize,

    /// Deepest WAL tail served before falling back to a full snapshot (default: 1000)
    pub max_wal_depth_on_force_sync: i64,

    /// Ask followers for compressed traffic (default: false)
    pub enable_compression: bool,

    /// Timeout of the liveness probe (default: 5s)
    pub status_timeout: Duration,
}

impl Default for ReplThreadConfig {
    fn default() -> Self {
        Self {
            app_name: "docdb_replicator".to_string(),
            updates_timeout: Duration::from_secs(20),
            sync_timeout: Duration::from_secs(60),
            retry_sync_interval: Duration::from_millis(3000),
            ns_copy_retry_interval: Duration::from_millis(2000),
            backoff_step: Duration::from_millis(150),
            role_switch_step: Duration::from_millis(150),
            max_role_switch_retries: 50,
            parallel_syncs_per_thread: 2,
            batching_routines_count: 100,
            max_wal_depth_on_force_sync: 1000,
            enable_compression: false,
            status_timeout: Duration::from_secs(5),
        }
    }
}

impl ReplThreadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the retry interval after a failed node routine.
    pub fn retry_sync_interval(mut self, interval: Duration) -> Self {
        self.retry_sync_interval = interval;
        self
    }

    /// Set the retry interval used while a namespace is being copied.
    pub fn ns_copy_retry_interval(mut self, interval: Duration) -> Self {
        self.ns_copy_retry_interval = interval;
        self
    }

    /// Set the backoff sleep granularity.
    pub fn backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Set the remote role polling step and retry count.
    pub fn role_switch(mut self, step: Duration, max_retries: usize) -> Self {
        self.role_switch_step = step;
        self.max_role_switch_retries = max_retries;
        self
    }

    /// Set the per-thread namespace sync limit.
    pub fn parallel_syncs_per_thread(mut self, count: usize) -> Self {
        self.parallel_syncs_per_thread = count;
        self
    }

    /// Set the number of batched updates in flight.
    pub fn batching_routines_count(mut self, count: usize) -> Self {
        self.batching_routines_count = count;
        self
    }

    /// Set the deepest WAL tail used for incremental sync.
    pub fn max_wal_depth_on_force_sync(mut self, depth: i64) -> Self {
        self.max_wal_depth_on_force_sync = depth;
        self
    }

    /// Set sync and updates timeouts.
    pub fn timeouts(mut self, updates: Duration, sync: Duration) -> Self {
        self.updates_timeout = updates;
        self.sync_timeout = sync;
        self
    }

    /// Ask followers for compressed traffic.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() {
            return Err(ConfigError::MissingAppName);
        }
        if self.batching_routines_count == 0 {
            return Err(ConfigError::ZeroBatchingRoutines);
        }
        if self.backoff_step.is_zero() || self.role_switch_step.is_zero() {
            return Err(ConfigError::ZeroStep);
        }
        if self.max_role_switch_retries == 0 {
            return Err(ConfigError::ZeroRoleSwitchRetries);
        }
        Ok(())
    }

    /// Session settings for follower clients.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            app_name: self.app_name.clone(),
            net_timeout: self.updates_timeout,
            enable_compression: self.enable_compression,
        }
    }
}

/// A follower node as seen by a replication thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub uid: NodeUid,
    pub server_id: ServerId,
    pub dsn: String,
}

impl NodeConfig {
    pub fn new(uid: NodeUid, server_id: ServerId, dsn: impl Into<String>) -> Self {
        Self {
            uid,
            server_id,
            dsn: dsn.into(),
        }
    }
}

/// Which leaders a follower of async replication accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AsyncReplMode {
    #[default]
    Default,
    /// Replicate only while the local node leads its sync cluster.
    FromClusterLeader,
}

/// Role of the local node in async replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AsyncReplRole {
    #[default]
    None,
    Leader,
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncNodeConfig {
    pub server_id: ServerId,
    pub dsn: String,
    /// Namespaces replicated to this node; `None` inherits the global list.
    pub namespaces: Option<Vec<String>>,
    pub mode: AsyncReplMode,
}

impl AsyncNodeConfig {
    pub fn new(server_id: ServerId, dsn: impl Into<String>) -> Self {
        Self {
            server_id,
            dsn: dsn.into(),
            namespaces: None,
            mode: AsyncReplMode::Default,
        }
    }

    pub fn namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = Some(namespaces);
        self
    }

    pub fn mode(mut self, mode: AsyncReplMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Configuration of the async replicator.
#[derive(Debug, Clone)]
pub struct AsyncReplConfig {
    pub role: AsyncReplRole,
    pub nodes: Vec<AsyncNodeConfig>,
    /// Namespaces replicated to nodes without their own list; empty means all.
    pub namespaces: Vec<String>,
    /// Replication threads, 0 for the default of 4
    pub threads_count: usize,
    pub thread: ReplThreadConfig,
}

impl AsyncReplConfig {
    pub fn leader(nodes: Vec<AsyncNodeConfig>) -> Self {
        Self {
            role: AsyncReplRole::Leader,
            nodes,
            namespaces: Vec::new(),
            threads_count: 0,
            thread: ReplThreadConfig::default(),
        }
    }

    pub fn namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn threads_count(mut self, count: usize) -> Self {
        self.threads_count = count;
        self
    }

    pub fn thread(mut self, thread: ReplThreadConfig) -> Self {
        self.thread = thread;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thread.validate()?;
        if self.role == AsyncReplRole::Leader {
            for (i, node) in self.nodes.iter().enumerate() {
                if node.dsn.is_empty() {
                    return Err(ConfigError::MissingDsn(i));
                }
            }
        }
        Ok(())
    }
}

/// A follower of the synchronous cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNodeConfig {
    pub server_id: ServerId,
    pub dsn: String,
}

impl ClusterNodeConfig {
    pub fn new(server_id: ServerId, dsn: impl Into<String>) -> Self {
        Self {
            server_id,
            dsn: dsn.into(),
        }
    }
}

/// Configuration of the synchronous cluster replication thread.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Every cluster member except the local one.
    pub nodes: Vec<ClusterNodeConfig>,
    /// Namespaces replicated by the cluster; empty means all.
    pub namespaces: Vec<String>,
    pub thread: ReplThreadConfig,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<ClusterNodeConfig>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn thread(mut self, thread: ReplThreadConfig) -> Self {
        self.thread = thread;
        self
    }

    /// Cluster size, local node included.
    pub fn total_nodes(&self) -> usize {
        self.nodes.len() + 1
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thread.validate()?;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.dsn.is_empty() {
                return Err(ConfigError::MissingDsn(i));
            }
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("app_name is required")]
    MissingAppName,
    #[error("batching_routines_count must be positive")]
    ZeroBatchingRoutines,
    #[error("backoff and role switch steps must be positive")]
    ZeroStep,
    #[error("max_role_switch_retries must be positive")]
    ZeroRoleSwitchRetries,
    #[error("node #{0} has no dsn")]
    MissingDsn(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplThreadConfig::default();
        assert_eq!(config.role_switch_step, Duration::from_millis(150));
        assert_eq!(config.ns_copy_retry_interval, Duration::from_millis(2000));
        assert_eq!(config.max_role_switch_retries, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ReplThreadConfig::new()
            .app_name("test")
            .retry_sync_interval(Duration::from_millis(20))
            .role_switch(Duration::from_millis(5), 10)
            .batching_routines_count(4);

        assert_eq!(config.app_name, "test");
        assert_eq!(config.retry_sync_interval, Duration::from_millis(20));
        assert_eq!(config.max_role_switch_retries, 10);
        assert_eq!(config.client_config().app_name, "test");
    }

    #[test]
    fn test_validate_zero_batching() {
        let config = ReplThreadConfig::new().batching_routines_count(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchingRoutines));
    }

    #[test]
    fn test_validate_zero_step() {
        let config = ReplThreadConfig::new().backoff_step(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroStep));
    }

    #[test]
    fn test_validate_missing_dsn() {
        let config = AsyncReplConfig::leader(vec![
            AsyncNodeConfig::new(ServerId(2), "mem://follower"),
            AsyncNodeConfig::new(ServerId(3), ""),
        ]);
        assert_eq!(config.validate(), Err(ConfigError::MissingDsn(1)));
    }

    #[test]
    fn test_cluster_config() {
        let config = ClusterConfig::new(vec![
            ClusterNodeConfig::new(ServerId(2), "mem://b"),
            ClusterNodeConfig::new(ServerId(3), "mem://c"),
        ])
        .namespaces(vec!["items".into()]);
        assert_eq!(config.total_nodes(), 3);
        assert!(config.validate().is_ok());

        let config = ClusterConfig::new(vec![ClusterNodeConfig::new(ServerId(2), "")]);
        assert_eq!(config.validate(), Err(ConfigError::MissingDsn(0)));
    }
}
