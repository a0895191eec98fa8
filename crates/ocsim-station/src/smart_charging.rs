//! Smart-charging limit resolution
//!
//! Computes the effective power limit for a connector from its stacked
//! charging profiles: connector-specific profiles and station-wide (connector
//! 0) profiles, higher stack level first. Recurring schedules are translated
//! into the current interval, relative schedules are rebased onto the running
//! transaction, ampere limits are converted to watts, and the result is
//! capped by the connector's share of the station's rated power.

use crate::connectors::ConnectorModel;
use crate::reconcile::StationInfo;
use chrono::{DateTime, Duration, Utc};
use ocsim_types::{
    units, ChargingProfile, ChargingProfileKind, ChargingRateUnit, ConnectorId,
};
use tracing::{debug, error, warn};

/// The winning limit and the profile it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLimit {
    pub limit_watts: f64,
    pub profile_id: i32,
    pub stack_level: i32,
}

/// Resolve the power limit for `connector_id` at `now`.
/// `None` means unlimited (no applicable profile).
pub fn resolve_power_limit(
    info: &StationInfo,
    model: &ConnectorModel,
    connector_id: ConnectorId,
    now: DateTime<Utc>,
) -> Option<ResolvedLimit> {
    let connector = model.connector(connector_id)?;

    // Connector-specific profiles take precedence over station-wide ones at
    // equal stack level; the stable sort preserves that order.
    let mut profiles: Vec<ChargingProfile> = connector.charging_profiles.clone();
    if connector_id > 0 {
        if let Some(station) = model.connector(0) {
            profiles.extend(station.charging_profiles.iter().cloned());
        }
    }
    profiles.sort_by(|a, b| b.stack_level.cmp(&a.stack_level));

    let transaction_start = connector.transaction.start_date;

    for profile in &profiles {
        let Some(raw_limit) = profile_limit_at(profile, transaction_start, now) else {
            continue;
        };

        let phases = profile
            .charging_schedule
            .charging_schedule_period
            .first()
            .and_then(|p| p.number_phases)
            .unwrap_or(info.number_of_phases);
        let mut limit_watts = match profile.charging_schedule.charging_rate_unit {
            ChargingRateUnit::W => raw_limit,
            ChargingRateUnit::A => units::amperage_to_watts(
                raw_limit,
                info.voltage_out,
                phases,
                info.current_out_type,
            ),
        };

        let divider = model.power_divider(info.power_shared_by_connectors);
        let connector_maximum = info.maximum_power / divider as f64;
        if limit_watts > connector_maximum {
            error!(
                connector_id,
                profile_id = profile.charging_profile_id,
                limit_watts,
                connector_maximum,
                "profile limit exceeds the connector's power share, clamping"
            );
            limit_watts = connector_maximum;
        }

        debug!(
            connector_id,
            profile_id = profile.charging_profile_id,
            stack_level = profile.stack_level,
            limit_watts,
            "resolved charging limit"
        );
        return Some(ResolvedLimit {
            limit_watts,
            profile_id: profile.charging_profile_id,
            stack_level: profile.stack_level,
        });
    }

    None
}

/// The raw limit a single profile yields at `now`, in the profile's own unit.
fn profile_limit_at(
    profile: &ChargingProfile,
    transaction_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<f64> {
    if !profile.is_valid_at(now) {
        debug!(
            profile_id = profile.charging_profile_id,
            "profile outside its validity window"
        );
        return None;
    }

    let mut schedule = profile.charging_schedule.clone();

    match profile.charging_profile_kind {
        ChargingProfileKind::Relative => {
            // Anchored to the running transaction; without one there is
            // nothing to anchor to.
            let start = transaction_start?;
            if schedule.start_schedule.is_some() {
                warn!(
                    profile_id = profile.charging_profile_id,
                    "relative profile carries a startSchedule, ignoring it"
                );
            }
            schedule.start_schedule = Some(start);
        }
        ChargingProfileKind::Recurring => {
            let Some(kind) = profile.recurrency_kind else {
                warn!(
                    profile_id = profile.charging_profile_id,
                    "recurring profile without recurrencyKind, skipping"
                );
                return None;
            };
            let Some(start) = schedule.start_schedule else {
                warn!(
                    profile_id = profile.charging_profile_id,
                    "recurring profile without startSchedule, skipping"
                );
                return None;
            };
            let period = kind.period_seconds();
            // Translate the anchor forward (or back) by whole periods so
            // that now falls inside [start, start + period).
            let elapsed = (now - start).num_seconds();
            let shift = elapsed.div_euclid(period) * period;
            schedule.start_schedule = Some(start + Duration::seconds(shift));
            // A missing or oversized duration covers exactly one interval.
            schedule.duration = Some(match schedule.duration {
                Some(duration) if duration <= period => duration,
                _ => period,
            });
        }
        ChargingProfileKind::Absolute => {
            if schedule.start_schedule.is_none() {
                warn!(
                    profile_id = profile.charging_profile_id,
                    "absolute profile without startSchedule, skipping"
                );
                return None;
            }
        }
    }

    let start = schedule.start_schedule?;
    if now < start {
        return None;
    }
    if let Some(duration) = schedule.duration {
        if now >= start + Duration::seconds(duration) {
            return None;
        }
    }

    schedule.normalize();
    if !schedule.is_well_formed() {
        warn!(
            profile_id = profile.charging_profile_id,
            "schedule periods do not start at offset 0, skipping"
        );
        return None;
    }

    // Last period whose absolute start is not after now.
    let offset = (now - start).num_seconds();
    schedule
        .charging_schedule_period
        .iter()
        .take_while(|p| i64::from(p.start_period) <= offset)
        .last()
        .map(|p| p.limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectorState;
    use chrono::TimeZone;
    use ocsim_types::{
        ChargingProfilePurpose, ChargingSchedule, ChargingSchedulePeriod, CurrentType,
        OcppVersion, RecurrencyKind,
    };
    use std::collections::BTreeMap;

    fn info() -> StationInfo {
        StationInfo {
            station_id: "CS-TEST-0001".into(),
            hash_id: "hash".into(),
            template_hash: "hash".into(),
            charge_point_vendor: "OCSIM".into(),
            charge_point_model: "Virtual".into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            meter_serial_number: None,
            meter_type: None,
            firmware_version: None,
            firmware_version_pattern: crate::reconcile::DEFAULT_FIRMWARE_VERSION_PATTERN.into(),
            firmware_upgrade: None,
            firmware_status: ocsim_types::FirmwareStatus::Installed,
            ocpp_version: OcppVersion::V16,
            current_out_type: CurrentType::Ac,
            voltage_out: 230,
            number_of_phases: 3,
            maximum_power: 44_160.0,
            maximum_amperage: 64,
            use_connector_id0: true,
            supervision_urls: vec!["ws://localhost:8010/ocpp".into()],
            supervision_url_ocpp_configuration: false,
            supervision_url_ocpp_key: None,
            amperage_limitation_ocpp_key: None,
            auto_register: false,
            registration_max_retries: -1,
            auto_reconnect_max_retries: -1,
            reconnect_exponential_delay: false,
            stop_on_connection_failure: true,
            connection_timeout: 30,
            reset_time: 60,
            begin_end_meter_values: false,
            ocpp_strict_compliance: true,
            out_of_order_end_meter_values: false,
            metering_per_transaction: true,
            station_info_persistent_configuration: false,
            ocpp_persistent_configuration: true,
            automatic_transaction_generator_persistent_configuration: false,
            enable_statistics: false,
            stop_transactions_on_stopped: true,
            power_shared_by_connectors: false,
            remote_authorization: true,
            id_tags_file: None,
        }
    }

    fn model() -> ConnectorModel {
        let mut map = BTreeMap::new();
        map.insert(0, ConnectorState::default());
        map.insert(1, ConnectorState::default());
        map.insert(2, ConnectorState::default());
        ConnectorModel::with_connectors(map)
    }

    fn profile(
        id: i32,
        stack_level: i32,
        kind: ChargingProfileKind,
        unit: ChargingRateUnit,
        periods: Vec<(i32, f64)>,
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: kind,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: Some(86_400),
                start_schedule: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                charging_rate_unit: unit,
                charging_schedule_period: periods
                    .into_iter()
                    .map(|(start_period, limit)| ChargingSchedulePeriod {
                        start_period,
                        limit,
                        number_phases: None,
                    })
                    .collect(),
                min_charging_rate: None,
            },
        }
    }

    #[test]
    fn highest_stack_level_wins() {
        let info = info();
        let mut model = model();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        // Two active ampere profiles: stack 1 at 16 A, stack 2 at 10 A.
        {
            let connector = model.connector_mut(1).unwrap();
            connector.set_charging_profile(profile(
                1,
                1,
                ChargingProfileKind::Absolute,
                ChargingRateUnit::A,
                vec![(0, 16.0)],
            ));
            connector.set_charging_profile(profile(
                2,
                2,
                ChargingProfileKind::Absolute,
                ChargingRateUnit::A,
                vec![(0, 10.0)],
            ));
        }

        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.profile_id, 2);
        // 10 A * 230 V * 3 phases
        assert_eq!(resolved.limit_watts, 6_900.0);
    }

    #[test]
    fn weekly_recurring_translates_to_current_week() {
        let info = info();
        let mut model = model();

        let mut weekly = profile(
            7,
            0,
            ChargingProfileKind::Recurring,
            ChargingRateUnit::W,
            vec![(0, 5_000.0)],
        );
        weekly.recurrency_kind = Some(RecurrencyKind::Weekly);
        model.connector_mut(1).unwrap().set_charging_profile(weekly);

        // Anchor Monday 2024-01-01; three weeks later, mid-day Monday.
        let now = Utc.with_ymd_and_hms(2024, 1, 22, 12, 0, 0).unwrap();
        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.limit_watts, 5_000.0);

        // Tuesday is outside the one-day duration of the translated window.
        let tuesday = Utc.with_ymd_and_hms(2024, 1, 23, 12, 0, 0).unwrap();
        assert!(resolve_power_limit(&info, &model, 1, tuesday).is_none());
    }

    #[test]
    fn daily_recurring_clamps_oversized_duration() {
        let info = info();
        let mut model = model();

        let mut daily = profile(
            3,
            0,
            ChargingProfileKind::Recurring,
            ChargingRateUnit::W,
            vec![(0, 7_000.0)],
        );
        daily.recurrency_kind = Some(RecurrencyKind::Daily);
        // Ten-day duration makes no sense for a daily recurrence.
        daily.charging_schedule.duration = Some(10 * 86_400);
        model.connector_mut(1).unwrap().set_charging_profile(daily);

        let now = Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap();
        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.limit_watts, 7_000.0);
    }

    #[test]
    fn relative_profile_requires_transaction() {
        let info = info();
        let mut model = model();

        let mut relative = profile(
            4,
            0,
            ChargingProfileKind::Relative,
            ChargingRateUnit::W,
            vec![(0, 11_000.0)],
        );
        relative.charging_schedule.start_schedule = None;
        model
            .connector_mut(1)
            .unwrap()
            .set_charging_profile(relative);

        let now = Utc::now();
        // No transaction: profile is skipped.
        assert!(resolve_power_limit(&info, &model, 1, now).is_none());

        // With a transaction the schedule anchors to its start.
        model.connector_mut(1).unwrap().transaction.begin(
            1,
            "TAG",
            now - Duration::seconds(600),
            false,
        );
        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.limit_watts, 11_000.0);
    }

    #[test]
    fn station_wide_profiles_apply_to_connectors() {
        let info = info();
        let mut model = model();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        model.connector_mut(0).unwrap().set_charging_profile(profile(
            9,
            0,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 9_000.0)],
        ));

        let resolved = resolve_power_limit(&info, &model, 2, now).unwrap();
        assert_eq!(resolved.profile_id, 9);
        assert_eq!(resolved.limit_watts, 9_000.0);
    }

    #[test]
    fn connector_profile_beats_station_profile_at_same_stack() {
        let info = info();
        let mut model = model();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        model.connector_mut(0).unwrap().set_charging_profile(profile(
            10,
            1,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 9_000.0)],
        ));
        model.connector_mut(1).unwrap().set_charging_profile(profile(
            11,
            1,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 4_000.0)],
        ));

        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.profile_id, 11);
    }

    #[test]
    fn period_walk_picks_the_active_segment() {
        let info = info();
        let mut model = model();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        model.connector_mut(1).unwrap().set_charging_profile(profile(
            5,
            0,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 11_000.0), (3_600, 7_000.0), (7_200, 3_000.0)],
        ));

        let cases = [
            (start + Duration::seconds(10), 11_000.0),
            (start + Duration::seconds(3_600), 7_000.0),
            (start + Duration::seconds(7_199), 7_000.0),
            (start + Duration::seconds(10_000), 3_000.0),
        ];
        for (now, expected) in cases {
            let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
            assert_eq!(resolved.limit_watts, expected, "at {now}");
        }
    }

    #[test]
    fn limit_is_capped_by_power_share() {
        let info = info();
        let mut model = model();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        // Two chargeable connectors share 44.16 kW -> 22.08 kW each.
        model.connector_mut(1).unwrap().set_charging_profile(profile(
            6,
            0,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 40_000.0)],
        ));

        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.limit_watts, 44_160.0 / 2.0);
    }

    #[test]
    fn malformed_periods_skip_the_profile() {
        let info = info();
        let mut model = model();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        // First period does not start at 0.
        model.connector_mut(1).unwrap().set_charging_profile(profile(
            8,
            5,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(60, 1_000.0)],
        ));
        model.connector_mut(1).unwrap().set_charging_profile(profile(
            12,
            1,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 2_000.0)],
        ));

        // The malformed higher-stack profile is skipped, not fatal.
        let resolved = resolve_power_limit(&info, &model, 1, now).unwrap();
        assert_eq!(resolved.profile_id, 12);
    }

    #[test]
    fn expired_validity_window_skips() {
        let info = info();
        let mut model = model();

        let mut expired = profile(
            13,
            0,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 5_000.0)],
        );
        expired.valid_to = Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        model.connector_mut(1).unwrap().set_charging_profile(expired);

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(resolve_power_limit(&info, &model, 1, now).is_none());
    }

    #[test]
    fn no_profiles_means_unlimited() {
        let info = info();
        let model = model();
        assert!(resolve_power_limit(&info, &model, 1, Utc::now()).is_none());
    }
}
