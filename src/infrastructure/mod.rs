//! Adapters implementing the domain ports.

pub mod in_memory;
pub mod log_sinks;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
