mod replication_client;
mod storage_engine;

pub use replication_client::{
    ClientConfig, ClientFactory, ClientTransaction, ConnectionObserver, ObserverId,
    ReplicationClient,
};
pub use storage_engine::StorageEngine;
