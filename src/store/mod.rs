//! Shared key-value store abstraction for the cluster-coordinated backend.

mod client;
pub mod scripts;
mod redis;

pub use client::{StoreClient, StoreError};
pub use self::redis::RedisStoreClient;
