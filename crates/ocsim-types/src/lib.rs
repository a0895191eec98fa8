//! # Shared Types for the OCSIM Charging Station Simulator
//!
//! This crate provides the domain vocabulary shared by every other crate in
//! the workspace: OCPP status and registration enums, the charging profile
//! model used by the smart-charging resolver, electric unit conversions, and
//! the OCPP-J error taxonomy.

pub mod error;
pub mod profile;
pub mod status;
pub mod units;

pub use error::{OcppError, OcppErrorCode, OcppResult};
pub use profile::{
    ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, ChargingRateUnit,
    ChargingSchedule, ChargingSchedulePeriod, RecurrencyKind,
};
pub use status::{
    AvailabilityType, ChargePointErrorCode, ConnectorStatus, FirmwareStatus, OcppVersion,
    RegistrationStatus,
};
pub use units::CurrentType;

/// Transaction identifier assigned by the Central System.
pub type TransactionId = i32;

/// Connector identifier. Id 0 addresses the station as a whole by OCPP
/// convention; transactions only ever run on ids > 0.
pub type ConnectorId = u32;

/// Reservation identifier assigned by the Central System.
pub type ReservationId = i32;
