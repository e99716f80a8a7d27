//! Shared utilities for the Hiroba gateway packages.

pub mod logger;
pub mod time;
