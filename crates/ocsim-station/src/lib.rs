//! # OCSIM Station Core
//!
//! The core of a simulated OCPP charging station: template reconciliation,
//! connector/EVSE state, the OCPP-J message engine with its pending-request
//! cache and outgoing buffer, smart-charging limit resolution, reservations,
//! and the station runtime driving registration, heartbeats, and meter
//! values against a Central System.

pub mod atg;
pub mod cache;
pub mod config_store;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod events;
pub mod lock;
pub mod persist;
pub mod reconcile;
pub mod reservation;
pub mod services;
pub mod smart_charging;
pub mod state;
pub mod station;
pub mod stats;
pub mod template;

pub use engine::{CallOptions, Engine};
pub use error::{StationError, StationResult};
pub use events::{EventBus, StationEvent};
pub use reconcile::StationInfo;
pub use smart_charging::{resolve_power_limit, ResolvedLimit};
pub use station::{ChannelFactory, RunState, Station, StationOptions, WebSocketFactory};
