//! Outbound Adapters
//!
//! In-memory implementations of the storage engine and replication client
//! ports.

mod memory_client;
mod memory_storage;

pub use memory_client::{InMemoryClient, InMemoryClientFactory, InMemoryTransaction};
pub use memory_storage::{InMemoryStorage, WalOp};
