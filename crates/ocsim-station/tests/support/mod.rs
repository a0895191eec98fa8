//! Test harness: an in-memory Central System double
//!
//! Stands in for the WebSocket channel so scenario tests can script the
//! Central System's side of the conversation: automatic CALLRESULTs for
//! station requests, injected CALLs toward the station, and connection drops.

use async_trait::async_trait;
use chrono::Utc;
use ocsim_messages::Frame;
use ocsim_station::station::ChannelFactory;
use ocsim_transport::{
    ChannelEvent, ChannelEvents, ChannelState, MessageChannel, TransportError, TransportResult,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Install a test subscriber once; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct CentralSystemDouble {
    inner: Arc<CsInner>,
}

struct CsInner {
    boot_responses: Mutex<VecDeque<Value>>,
    frames: Mutex<Vec<Frame>>,
    event_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<ChannelEvent>>>,
    open: AtomicBool,
    next_transaction_id: AtomicI32,
}

impl Default for CentralSystemDouble {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralSystemDouble {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CsInner {
                boot_responses: Mutex::new(VecDeque::new()),
                frames: Mutex::new(Vec::new()),
                event_tx: Mutex::new(None),
                open: AtomicBool::new(false),
                next_transaction_id: AtomicI32::new(1000),
            }),
        }
    }

    pub fn factory(&self) -> Arc<dyn ChannelFactory> {
        Arc::new(DoubleFactory {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Queue a scripted BootNotification response; once the queue is empty
    /// the double answers Accepted with a 300 s interval.
    pub fn push_boot_response(&self, status: &str, interval: i64) {
        self.inner.boot_responses.lock().unwrap().push_back(json!({
            "status": status,
            "currentTime": Utc::now(),
            "interval": interval,
        }));
    }

    /// Every frame the station has sent so far.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.frames.lock().unwrap().clone()
    }

    pub fn calls_of(&self, action: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Call {
                    action: a, payload, ..
                } if a == action => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Inject a CALL toward the station; returns its message id.
    pub fn call_station(&self, action: &str, payload: Value) -> String {
        let frame = Frame::new_call(action, payload);
        let unique_id = frame.unique_id().to_string();
        if let Some(tx) = self.inner.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(ChannelEvent::MessageReceived(frame.serialize()));
        }
        unique_id
    }

    /// The station's reply to an injected CALL, once it arrives.
    pub fn reply_to(&self, unique_id: &str) -> Option<Frame> {
        self.frames().into_iter().find(|frame| {
            matches!(frame, Frame::CallResult { .. } | Frame::CallError { .. })
                && frame.unique_id() == unique_id
        })
    }

    pub async fn wait_for_reply(&self, unique_id: &str) -> Frame {
        for _ in 0..200 {
            if let Some(frame) = self.reply_to(unique_id) {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no reply to {unique_id} within 2 s");
    }

    pub async fn wait_for_calls(&self, action: &str, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let calls = self.calls_of(action);
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} {action} calls, saw {}",
            self.calls_of(action).len()
        );
    }

    /// Simulate an abnormal connection loss.
    pub fn drop_connection(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        if let Some(tx) = self.inner.event_tx.lock().unwrap().take() {
            let _ = tx.send(ChannelEvent::Closed {
                reason: "connection lost".into(),
                clean: false,
            });
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

impl CsInner {
    fn respond_to(&self, action: &str, _payload: &Value) -> Value {
        match action {
            "BootNotification" => self
                .boot_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    json!({
                        "status": "Accepted",
                        "currentTime": Utc::now(),
                        "interval": 300,
                    })
                }),
            "Heartbeat" => json!({"currentTime": Utc::now()}),
            "StartTransaction" => json!({
                "idTagInfo": {"status": "Accepted"},
                "transactionId": self.next_transaction_id.fetch_add(1, Ordering::SeqCst),
            }),
            "StopTransaction" => json!({"idTagInfo": {"status": "Accepted"}}),
            _ => json!({}),
        }
    }
}

struct DoubleFactory {
    inner: Arc<CsInner>,
}

#[async_trait]
impl ChannelFactory for DoubleFactory {
    async fn connect(
        &self,
        _endpoint: &Url,
        _subprotocol: &str,
        _credentials: Option<(String, String)>,
    ) -> TransportResult<(Arc<dyn MessageChannel>, ChannelEvents)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let _ = tx.send(ChannelEvent::Opened {
            subprotocol: Some("ocpp1.6".into()),
        });
        *self.inner.event_tx.lock().unwrap() = Some(tx);
        self.inner.open.store(true, Ordering::SeqCst);
        Ok((
            Arc::new(DoubleChannel {
                inner: Arc::clone(&self.inner),
            }) as Arc<dyn MessageChannel>,
            rx,
        ))
    }
}

struct DoubleChannel {
    inner: Arc<CsInner>,
}

#[async_trait]
impl MessageChannel for DoubleChannel {
    async fn send(&self, text: String) -> TransportResult<()> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        let frame = Frame::parse(&text).map_err(|e| TransportError::Send(e.to_string()))?;
        self.inner.frames.lock().unwrap().push(frame.clone());

        if let Frame::Call {
            unique_id,
            action,
            payload,
        } = frame
        {
            let response = self.inner.respond_to(&action, &payload);
            if let Some(tx) = self.inner.event_tx.lock().unwrap().as_ref() {
                let reply = Frame::call_result(unique_id, response);
                let _ = tx.send(ChannelEvent::MessageReceived(reply.serialize()));
            }
        }
        Ok(())
    }

    async fn ping(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.open.store(false, Ordering::SeqCst);
        if let Some(tx) = self.inner.event_tx.lock().unwrap().take() {
            let _ = tx.send(ChannelEvent::Closed {
                reason: "closed by station".into(),
                clean: true,
            });
        }
        Ok(())
    }

    fn state(&self) -> ChannelState {
        if self.inner.open.load(Ordering::SeqCst) {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }
}

/// Write a station template into a scratch directory and return both paths.
pub async fn write_template(template: Value) -> (std::path::PathBuf, std::path::PathBuf) {
    let dir = std::env::temp_dir().join(format!("ocsim-test-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let template_path = dir.join("station.json");
    tokio::fs::write(&template_path, template.to_string())
        .await
        .unwrap();
    (template_path, dir)
}

/// A template with sane test defaults; callers override what they need.
pub fn base_template() -> Value {
    json!({
        "baseName": "CS-TEST",
        "chargePointVendor": "OCSIM",
        "chargePointModel": "Virtual",
        "supervisionUrls": ["ws://localhost:8010/ocpp"],
        "power": 22, "powerUnit": "kW",
        "voltageOut": 230, "numberOfPhases": 3,
        "numberOfConnectors": 2,
        "useConnectorId0": true,
        "Connectors": {"0": {}, "1": {}},
        "connectionTimeout": 1,
        "resetTime": 1,
        "ocppPersistentConfiguration": true,
        "stationInfoPersistentConfiguration": true
    })
}
