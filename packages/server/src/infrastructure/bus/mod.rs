//! Bus implementations
//!
//! - `inmemory`: tokio broadcast channel, one process only
//! - `nats`: NATS core pub/sub shared by every gateway instance

pub mod inmemory;
pub mod nats;

pub use inmemory::InMemoryBus;
pub use nats::NatsBus;
