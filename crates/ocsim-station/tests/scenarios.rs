//! End-to-end scenarios against the in-memory Central System double

mod support;

use chrono::{Duration as ChronoDuration, Utc};
use ocsim_messages::Frame;
use ocsim_station::reservation::Reservation;
use ocsim_station::station::{RunState, Station, StationOptions};
use ocsim_station::StationEvent;
use serde_json::json;
use std::time::Duration;
use support::{base_template, init_tracing, write_template, CentralSystemDouble};

async fn station_with(
    cs: &CentralSystemDouble,
    template: serde_json::Value,
    tune: impl FnOnce(&mut StationOptions),
) -> Station {
    init_tracing();
    let (template_path, dir) = write_template(template).await;
    let mut options = StationOptions::new(1, template_path, dir.join("configurations"));
    options.channel_factory = cs.factory();
    tune(&mut options);
    Station::from_template(options).await.unwrap()
}

#[tokio::test]
async fn boot_accepted_starts_heartbeat_and_announces_connectors() {
    let cs = CentralSystemDouble::new();
    cs.push_boot_response("Accepted", 60);
    let station = station_with(&cs, base_template(), |_| {}).await;

    station.start().await.unwrap();

    assert_eq!(station.run_state(), RunState::Operating);
    assert!(station.is_accepted());
    // Heartbeat period follows the interval from the boot response.
    assert_eq!(station.heartbeat_period(), Some(Duration::from_secs(60)));

    // One StatusNotification(Available) per chargeable connector.
    let statuses = cs.wait_for_calls("StatusNotification", 2).await;
    let connector_ids: Vec<u64> = statuses
        .iter()
        .map(|payload| payload["connectorId"].as_u64().unwrap())
        .collect();
    assert_eq!(connector_ids, vec![1, 2]);
    assert!(statuses
        .iter()
        .all(|payload| payload["status"] == "Available"));

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn boot_pending_retries_after_interval() {
    let cs = CentralSystemDouble::new();
    cs.push_boot_response("Pending", 1);
    cs.push_boot_response("Accepted", 30);
    let station = station_with(&cs, base_template(), |_| {}).await;

    let started = tokio::time::Instant::now();
    station.start().await.unwrap();
    let elapsed = started.elapsed();

    // The second BootNotification went out after the Pending interval.
    assert!(elapsed >= Duration::from_secs(1), "started in {elapsed:?}");
    assert_eq!(cs.calls_of("BootNotification").len(), 2);
    assert_eq!(station.registration_retry_count(), 1);
    assert!(station.is_accepted());

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn closed_channel_buffers_until_reconnect_flush() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |options| {
        options.flush_interval = Duration::from_millis(200);
    })
    .await;
    station.start().await.unwrap();

    cs.drop_connection();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A heartbeat issued while the channel is down lands in the buffer.
    let engine = std::sync::Arc::clone(station.engine());
    let pending = tokio::spawn(async move {
        engine
            .call("Heartbeat", json!({}), ocsim_station::CallOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(station.engine().buffered_frame_count().await, 1);

    // Reconnect (1 s constant delay) re-registers and the flush timer
    // drains the buffer.
    let mut drained = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if station.engine().buffered_frame_count().await == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "buffer did not drain after reconnect");
    assert!(cs.is_open());

    // The deferred heartbeat settles once its frame was flushed and answered.
    let response = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(response["currentTime"].is_string());

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn expired_reservation_is_swept_and_announced() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |options| {
        options.reservation_sweep_interval = Duration::from_millis(200);
    })
    .await;
    station.start().await.unwrap();
    let mut events = station.events().subscribe();

    // Plant an already-expired reservation on connector 1.
    {
        let mut model = station.shared_state().model.write().await;
        let connector = model.connector_mut(1).unwrap();
        connector.reservation = Some(Reservation {
            reservation_id: 11,
            connector_id: 1,
            id_tag: "TAG-EXP".into(),
            expiry_date: Utc::now() - ChronoDuration::seconds(1),
            parent_id_tag: None,
        });
    }

    // The sweep removes it and announces the connector Available again.
    let expired = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(StationEvent::ReservationExpired {
                reservation_id,
                connector_id,
                ..
            }) = events.recv().await
            {
                break (reservation_id, connector_id);
            }
        }
    })
    .await
    .expect("no expiry event");
    assert_eq!(expired, (11, 1));

    assert!(station
        .shared_state()
        .model
        .read()
        .await
        .connector(1)
        .unwrap()
        .reservation
        .is_none());

    let statuses = cs.calls_of("StatusNotification");
    let last_for_connector_1 = statuses
        .iter()
        .rev()
        .find(|payload| payload["connectorId"] == 1)
        .unwrap();
    assert_eq!(last_for_connector_1["status"], "Available");

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn get_configuration_round_trips_over_the_wire() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |_| {}).await;
    station.start().await.unwrap();

    let unique_id = cs.call_station("GetConfiguration", json!({}));
    let reply = cs.wait_for_reply(&unique_id).await;
    match reply {
        Frame::CallResult { payload, .. } => {
            let keys = payload["configurationKey"].as_array().unwrap();
            assert!(keys
                .iter()
                .any(|entry| entry["key"] == "HeartbeatInterval"));
        }
        other => panic!("expected CallResult, got {other:?}"),
    }

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn unknown_action_is_answered_with_call_error() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |_| {}).await;
    station.start().await.unwrap();

    let unique_id = cs.call_station("GetDiagnostics", json!({}));
    let reply = cs.wait_for_reply(&unique_id).await;
    assert!(matches!(reply, Frame::CallError { .. }));

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn remote_start_drives_a_transaction() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |_| {}).await;
    station.start().await.unwrap();

    let unique_id = cs.call_station(
        "RemoteStartTransaction",
        json!({"idTag": "TAG-REMOTE", "connectorId": 1}),
    );
    let reply = cs.wait_for_reply(&unique_id).await;
    match reply {
        Frame::CallResult { payload, .. } => assert_eq!(payload["status"], "Accepted"),
        other => panic!("expected CallResult, got {other:?}"),
    }

    // The station then opens the transaction and reports Charging.
    let starts = cs.wait_for_calls("StartTransaction", 1).await;
    assert_eq!(starts[0]["idTag"], "TAG-REMOTE");
    assert_eq!(starts[0]["connectorId"], 1);

    let mut seen_charging = false;
    for _ in 0..100 {
        if cs
            .calls_of("StatusNotification")
            .iter()
            .any(|payload| payload["connectorId"] == 1 && payload["status"] == "Charging")
        {
            seen_charging = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen_charging);

    let model = station.shared_state().model.read().await;
    let transaction = &model.connector(1).unwrap().transaction;
    assert!(transaction.started);
    assert_eq!(transaction.id, Some(1000));
    assert!(transaction.remote_started);
    drop(model);

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn reserve_now_then_transaction_consumes_reservation() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |_| {}).await;
    station.start().await.unwrap();

    let unique_id = cs.call_station(
        "ReserveNow",
        json!({
            "connectorId": 1,
            "expiryDate": Utc::now() + ChronoDuration::hours(1),
            "idTag": "TAG-R",
            "reservationId": 21
        }),
    );
    let reply = cs.wait_for_reply(&unique_id).await;
    match reply {
        Frame::CallResult { payload, .. } => assert_eq!(payload["status"], "Accepted"),
        other => panic!("expected CallResult, got {other:?}"),
    }

    // Starting a transaction with the reserving tag consumes the
    // reservation and passes its id to the Central System.
    station.start_transaction(1, "TAG-R").await.unwrap();
    let starts = cs.wait_for_calls("StartTransaction", 1).await;
    assert_eq!(starts[0]["reservationId"], 21);

    let model = station.shared_state().model.read().await;
    assert!(model.connector(1).unwrap().reservation.is_none());
    assert!(model.connector(1).unwrap().transaction.started);
    drop(model);

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn stop_announces_unavailable_and_persists() {
    let cs = CentralSystemDouble::new();
    let (template_path, dir) = write_template(base_template()).await;
    let configuration_dir = dir.join("configurations");
    let mut options = StationOptions::new(1, template_path, configuration_dir.clone());
    options.channel_factory = cs.factory();
    let station = Station::from_template(options).await.unwrap();

    station.start().await.unwrap();
    station.stop(None).await.unwrap();

    assert_eq!(station.run_state(), RunState::Stopped);
    assert!(!station.is_accepted());

    let unavailable: Vec<_> = cs
        .calls_of("StatusNotification")
        .into_iter()
        .filter(|payload| payload["status"] == "Unavailable")
        .collect();
    assert_eq!(unavailable.len(), 2);

    // Exactly one configuration file was written next to the template.
    let mut entries = tokio::fs::read_dir(&configuration_dir).await.unwrap();
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        files.push(entry.path());
    }
    assert_eq!(files.len(), 1);
    let content = tokio::fs::read_to_string(&files[0]).await.unwrap();
    assert!(content.contains("configurationHash"));
    assert!(content.contains("stationInfo"));
}

#[tokio::test]
async fn central_system_reset_restarts_the_station() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |_| {}).await;
    station.start().await.unwrap();

    let unique_id = cs.call_station("Reset", json!({"type": "Soft"}));
    let reply = cs.wait_for_reply(&unique_id).await;
    match reply {
        Frame::CallResult { payload, .. } => assert_eq!(payload["status"], "Accepted"),
        other => panic!("expected CallResult, got {other:?}"),
    }

    // Stop, one second of reset time, then a fresh boot.
    let mut operating_again = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if station.run_state() == RunState::Operating
            && cs.calls_of("BootNotification").len() >= 2
        {
            operating_again = true;
            break;
        }
    }
    assert!(operating_again, "station did not come back after reset");

    station.stop(None).await.unwrap();
}

#[tokio::test]
async fn double_start_is_rejected() {
    let cs = CentralSystemDouble::new();
    let station = station_with(&cs, base_template(), |_| {}).await;
    station.start().await.unwrap();
    assert!(station.start().await.is_err());
    station.stop(None).await.unwrap();
    assert!(station.stop(None).await.is_err());
}
