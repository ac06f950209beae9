//! Infrastructure-backed stream stores.
//!
//! The bus itself lives in `astra-events` as pure mechanics over the `StreamStore`
//! trait. This module provides the Redis Streams implementation.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamStore;
