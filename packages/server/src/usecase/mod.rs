//! UseCase layer: the Connection Registry, the Room Directory and the Event Bridge.

pub mod connection_registry;
pub mod error;
pub mod event_bridge;
pub mod room_directory;

pub use connection_registry::{
    ConnectionRegistry, DeliveryOutcome, Outbound, Registration, RegistryConfig,
};
pub use error::{BridgeError, RoomError};
pub use event_bridge::EventBridge;
pub use room_directory::{
    KeepReason, ReclaimDecision, ReclaimReport, RoomDirectory, RoomDirectoryConfig,
};
