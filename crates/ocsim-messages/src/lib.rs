//! # OCPP-J Messages
//!
//! Frame-level envelope (`Frame`) plus the typed payloads exchanged with a
//! Central System. The envelope is identical for every OCPP version; payload
//! shapes live in the per-version modules and are translated by the station's
//! version services.

pub mod actions;
pub mod frame;
pub mod v16;
pub mod v201;

pub use actions::{is_supported_incoming, Action};
pub use frame::Frame;
