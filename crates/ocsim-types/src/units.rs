//! Electric unit conversions
//!
//! Power arithmetic used by the template reconciler (amperage derivation)
//! and the smart-charging resolver (ampere limits to watts). AC sums over
//! the phase count; DC has no phase notion.

use serde::{Deserialize, Serialize};

/// Current type of the station's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CurrentType {
    #[default]
    Ac,
    Dc,
}

impl CurrentType {
    /// Nominal output voltage when the template does not declare one.
    pub fn default_voltage(&self) -> u32 {
        match self {
            CurrentType::Ac => 230,
            CurrentType::Dc => 400,
        }
    }
}

/// Convert an ampere limit to watts.
pub fn amperage_to_watts(amps: f64, voltage: u32, phases: u32, current: CurrentType) -> f64 {
    match current {
        CurrentType::Ac => amps * voltage as f64 * phases.max(1) as f64,
        CurrentType::Dc => amps * voltage as f64,
    }
}

/// Convert a watt limit to amperes per phase.
pub fn watts_to_amperage(watts: f64, voltage: u32, phases: u32, current: CurrentType) -> f64 {
    match current {
        CurrentType::Ac => watts / (voltage as f64 * phases.max(1) as f64),
        CurrentType::Dc => watts / voltage as f64,
    }
}

/// Maximum amperage a station can draw given its rated power, rounded to the
/// nearest whole ampere.
pub fn maximum_amperage(maximum_power: f64, voltage: u32, phases: u32, current: CurrentType) -> u32 {
    watts_to_amperage(maximum_power, voltage, phases, current).round() as u32
}
