//! Charging profile and schedule model
//!
//! Shared by both OCPP versions: 2.0.1 renames a few fields on the wire but
//! the schedule arithmetic is identical, so the resolver works on this model
//! and the version services translate at the edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Purpose of a charging profile within the profile stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ChargingProfilePurpose {
    /// Station-wide ceiling
    ChargePointMaxProfile,
    /// Default for transactions without a dedicated profile
    TxDefaultProfile,
    /// Bound to one transaction
    TxProfile,
}

/// How the schedule's start is anchored in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ChargingProfileKind {
    /// `start_schedule` is an absolute point in time
    Absolute,
    /// `start_schedule` repeats per `recurrency_kind`
    Recurring,
    /// Anchored to the start of the running transaction
    Relative,
}

/// Periodicity of a recurring profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

impl RecurrencyKind {
    /// Length of one recurrence interval in seconds.
    pub fn period_seconds(&self) -> i64 {
        match self {
            RecurrencyKind::Daily => 86_400,
            RecurrencyKind::Weekly => 7 * 86_400,
        }
    }
}

/// Unit of the period limits in a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

/// One segment of a charging schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    /// Offset in seconds from the start of the schedule
    pub start_period: i32,
    /// Limit in the schedule's rate unit
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<u32>,
}

/// A time-bounded sequence of limit periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
}

impl ChargingSchedule {
    /// Sort periods ascending by `start_period`.
    pub fn normalize(&mut self) {
        self.charging_schedule_period
            .sort_by_key(|p| p.start_period);
    }

    /// A schedule is well formed when its periods are sorted and the first
    /// one starts at offset 0.
    pub fn is_well_formed(&self) -> bool {
        !self.charging_schedule_period.is_empty()
            && self.charging_schedule_period[0].start_period == 0
            && self
                .charging_schedule_period
                .windows(2)
                .all(|w| w[0].start_period <= w[1].start_period)
    }
}

/// A charging profile as installed by SetChargingProfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    /// Priority within the stack; higher wins
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrency_kind: Option<RecurrencyKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub charging_schedule: ChargingSchedule,
}

impl ChargingProfile {
    /// Whether `now` falls inside the profile's validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(to) = self.valid_to {
            if now > to {
                return false;
            }
        }
        true
    }
}
