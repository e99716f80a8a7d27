//! Infrastructure layer: shared store, bus and wire formats.

pub mod bus;
pub mod dto;
pub mod store;
