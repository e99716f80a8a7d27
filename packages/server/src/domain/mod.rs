//! Domain layer: value objects, entities, the message envelope and the
//! interfaces of the shared store and the bus.

pub mod bus;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod repository;
pub mod subject;
pub mod value_object;

pub use bus::{BusMessage, BusSubscription, MessageBus};
pub use entity::{
    ClientMeta, Connection, Identity, InstanceStats, NewRoom, PresenceRecord, Room, RoomKind,
    RoomSettings, RoomStats, RoomUpdate,
};
pub use envelope::{DeliveryScope, Envelope, ErrorCode, MessageKind};
pub use error::{BusError, StoreError, ValueObjectError};
pub use repository::{GuardedDelete, MemberAdd, PresenceStore, RoomStore};
pub use value_object::{ConnectionId, RoomId, Timestamp, UserId};
