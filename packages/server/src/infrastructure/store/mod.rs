//! Shared store implementations
//!
//! - `inmemory`: single-process store for local runs and tests
//! - `redis_store`: Redis store shared by every gateway instance

pub mod inmemory;
pub mod redis_store;

pub use inmemory::InMemoryStore;
pub use redis_store::RedisStore;
