//! OCPP message engine
//!
//! Owns the request/response pairing: outbound CALLs are cached by message id
//! until their CALLRESULT, CALLERROR, or timeout; inbound CALLs are dispatched
//! to the version's incoming service and answered on the same channel.
//! Outbound CALLs are serialized under a per-station mutex, held across
//! cache-insert and transmit, per the OCPP-J one-in-flight rule. Frames that
//! cannot be sent while the channel is down land in the outgoing buffer and
//! are flushed periodically once the station is connected and accepted.

use crate::services::IncomingRequestService;
use crate::stats::StationStatistics;
use dashmap::DashMap;
use ocsim_messages::{actions, Frame};
use ocsim_transport::{ChannelState, MessageChannel};
use ocsim_types::{OcppError, OcppResult, OcppVersion};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Default response timeout for outbound CALLs.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between outgoing-buffer flush attempts.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Per-call options.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Fail immediately instead of buffering when the channel is down.
    pub skip_buffering_on_error: bool,
    pub response_timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            skip_buffering_on_error: false,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

struct PendingRequest {
    responder: oneshot::Sender<OcppResult<Value>>,
    action: String,
    #[allow(dead_code)]
    payload: Value,
    started: Instant,
}

/// The station's message engine.
pub struct Engine {
    version: OcppVersion,
    channel: RwLock<Option<Arc<dyn MessageChannel>>>,
    pending: DashMap<String, PendingRequest>,
    buffer: Mutex<Vec<String>>,
    send_lock: Mutex<()>,
    registered: AtomicBool,
    incoming: RwLock<Option<Arc<dyn IncomingRequestService>>>,
    stats: StdMutex<StationStatistics>,
    flush_interval: Duration,
    flush_handle: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(version: OcppVersion) -> Arc<Self> {
        Self::with_flush_interval(version, DEFAULT_FLUSH_INTERVAL)
    }

    /// Engine with a custom buffer-flush cadence.
    pub fn with_flush_interval(version: OcppVersion, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            version,
            channel: RwLock::new(None),
            pending: DashMap::new(),
            buffer: Mutex::new(Vec::new()),
            send_lock: Mutex::new(()),
            registered: AtomicBool::new(false),
            incoming: RwLock::new(None),
            stats: StdMutex::new(StationStatistics::new()),
            flush_interval,
            flush_handle: StdMutex::new(None),
        })
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    pub async fn set_incoming_service(&self, service: Arc<dyn IncomingRequestService>) {
        *self.incoming.write().await = Some(service);
    }

    pub async fn attach_channel(&self, channel: Arc<dyn MessageChannel>) {
        *self.channel.write().await = Some(channel);
    }

    pub async fn detach_channel(&self) {
        *self.channel.write().await = None;
    }

    /// Close and drop the current channel, if any.
    pub async fn close_channel(&self) {
        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close().await;
        }
    }

    /// WebSocket-level ping through the current channel.
    pub async fn ping_channel(&self) -> Result<(), ocsim_transport::TransportError> {
        match self.channel.read().await.clone() {
            Some(channel) => channel.ping().await,
            None => Err(ocsim_transport::TransportError::NotOpen),
        }
    }

    /// Mark the station registration state; buffered frames only flush once
    /// the Central System has accepted us.
    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub async fn channel_open(&self) -> bool {
        self.channel
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.state() == ChannelState::Open)
    }

    pub async fn buffered_frame_count(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub fn with_statistics<R>(&self, f: impl FnOnce(&StationStatistics) -> R) -> R {
        f(&self.stats.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Issue an outbound CALL and wait for its response.
    pub async fn call(
        self: &Arc<Self>,
        action: &str,
        payload: Value,
        options: CallOptions,
    ) -> OcppResult<Value> {
        let frame = Frame::new_call(action, payload.clone());
        let message_id = frame.unique_id().to_string();
        let text = frame.serialize();

        let (responder, response) = oneshot::channel();
        let request = PendingRequest {
            responder,
            action: action.to_string(),
            payload,
            started: Instant::now(),
        };

        let channel = self.channel.read().await.clone();
        let open = channel.as_ref().is_some_and(|c| c.state() == ChannelState::Open);

        if !open {
            if options.skip_buffering_on_error {
                return Err(OcppError::generic(format!(
                    "channel is not open, dropping {action}"
                )));
            }
            debug!(action, %message_id, "channel down, buffering frame");
            self.record_request(action, text.len());
            self.pending.insert(message_id, request);
            self.buffer.lock().await.push(text);
            self.ensure_flush_task();
            // Settlement is deferred until a flush transmits the frame.
            return response
                .await
                .map_err(|_| OcppError::generic("request abandoned"))?;
        }
        let channel = channel.unwrap_or_else(|| unreachable!("checked open above"));

        {
            // OCPP-J: one outbound CALL at a time per station.
            let _guard = self.send_lock.lock().await;
            self.record_request(action, text.len());
            self.pending.insert(message_id.clone(), request);

            if let Err(e) = channel.send(text.clone()).await {
                if options.skip_buffering_on_error {
                    warn!(action, error = %e, "send failed, rejecting call");
                    if let Some((_, request)) = self.pending.remove(&message_id) {
                        let _ = request
                            .responder
                            .send(Err(OcppError::generic(format!("send failed: {e}"))));
                    }
                } else {
                    warn!(action, error = %e, "send failed, buffering frame");
                    self.buffer.lock().await.push(text);
                    self.ensure_flush_task();
                }
            } else {
                self.arm_response_timeout(message_id, options.response_timeout);
            }
        }

        response
            .await
            .map_err(|_| OcppError::generic("request abandoned"))?
    }

    fn record_request(&self, action: &str, message_size: usize) {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record_request(action, message_size);
    }

    fn arm_response_timeout(self: &Arc<Self>, message_id: String, timeout: Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, request)) = engine.pending.remove(&message_id) {
                warn!(
                    action = %request.action,
                    %message_id, "response timeout elapsed"
                );
                engine
                    .stats
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .record_error(&request.action, request.started.elapsed());
                let _ = request.responder.send(Err(OcppError::generic(format!(
                    "no response to {} within {timeout:?}",
                    request.action
                ))));
            }
        });
    }

    /// Process one inbound frame.
    pub async fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                // No message id to answer to; all we can do is log it.
                error!(error = %e, "dropping malformed inbound frame");
                return;
            }
        };

        match frame {
            Frame::Call {
                unique_id,
                action,
                payload,
            } => {
                debug!(%action, %unique_id, "inbound call");
                let reply = match self.dispatch_call(&action, payload).await {
                    Ok(result) => Frame::call_result(unique_id, result),
                    Err(e) => {
                        warn!(%action, error = %e, "inbound call failed");
                        Frame::call_error(unique_id, &e)
                    }
                };
                self.send_reply(reply).await;
            }
            Frame::CallResult { unique_id, payload } => {
                match self.pending.remove(&unique_id) {
                    Some((_, request)) => {
                        self.stats
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .record_response(&request.action, request.started.elapsed());
                        let _ = request.responder.send(Ok(payload));
                    }
                    None => warn!(%unique_id, "response for unknown message id"),
                }
            }
            Frame::CallError {
                unique_id,
                code,
                description,
                details,
            } => match self.pending.remove(&unique_id) {
                Some((_, request)) => {
                    self.stats
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .record_error(&request.action, request.started.elapsed());
                    let _ = request.responder.send(Err(OcppError {
                        code,
                        description,
                        details: Some(details),
                    }));
                }
                None => warn!(%unique_id, "error for unknown message id"),
            },
        }
    }

    async fn dispatch_call(&self, action: &str, payload: Value) -> OcppResult<Value> {
        if !actions::is_supported_incoming(action, self.version) {
            return Err(match ocsim_messages::Action::parse(action) {
                Some(_) => OcppError::not_supported(format!(
                    "{action} is not supported for OCPP {}",
                    self.version
                )),
                None => OcppError::not_implemented(format!("unknown action {action}")),
            });
        }
        let service = self.incoming.read().await.clone();
        match service {
            Some(service) => service.handle(action, payload).await,
            None => Err(OcppError::internal("no incoming request service attached")),
        }
    }

    async fn send_reply(&self, reply: Frame) {
        let channel = self.channel.read().await.clone();
        let Some(channel) = channel else {
            warn!("no channel to send reply on");
            return;
        };
        if let Err(e) = channel.send(reply.serialize()).await {
            error!(error = %e, "failed to send reply frame");
        }
    }

    /// Fail every pending request, e.g. when the station stops.
    pub fn fail_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request.responder.send(Err(OcppError::generic(reason)));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Try to transmit every buffered frame right now. Gated on channel-open
    /// and registration Accepted. Returns the number of frames still queued.
    pub async fn flush_buffer(self: &Arc<Self>) -> usize {
        if !self.registered.load(Ordering::SeqCst) || !self.channel_open().await {
            return self.buffer.lock().await.len();
        }
        let channel = match self.channel.read().await.clone() {
            Some(channel) => channel,
            None => return self.buffer.lock().await.len(),
        };

        let queued: Vec<String> = self.buffer.lock().await.clone();
        for text in queued {
            match channel.send(text.clone()).await {
                Ok(()) => {
                    self.buffer.lock().await.retain(|f| f != &text);
                    if let Ok(Frame::Call { unique_id, .. }) = Frame::parse(&text) {
                        if self.pending.contains_key(&unique_id) {
                            self.arm_response_timeout(unique_id, DEFAULT_RESPONSE_TIMEOUT);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "buffer flush send failed, keeping frame");
                    break;
                }
            }
        }
        let remaining = self.buffer.lock().await.len();
        if remaining == 0 {
            info!("outgoing buffer drained");
        }
        remaining
    }

    /// Spawn the periodic flush task if the buffer has work and no task runs.
    fn ensure_flush_task(self: &Arc<Self>) {
        let mut handle = self.flush_handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let engine = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if engine.flush_buffer().await == 0 {
                    break;
                }
            }
        }));
    }

    /// Stop the flush task, e.g. on station stop.
    pub fn stop_flush_task(&self) {
        if let Some(handle) = self
            .flush_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ocsim_transport::TransportResult;
    use serde_json::json;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    /// In-memory channel double recording everything sent through it.
    pub struct MockChannel {
        pub sent: StdMutex<Vec<String>>,
        pub open: StdAtomicBool,
    }

    impl MockChannel {
        pub fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                open: StdAtomicBool::new(open),
            })
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageChannel for MockChannel {
        async fn send(&self, text: String) -> TransportResult<()> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(ocsim_transport::TransportError::NotOpen);
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn ping(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn close(&self) -> TransportResult<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn state(&self) -> ChannelState {
            if self.open.load(Ordering::SeqCst) {
                ChannelState::Open
            } else {
                ChannelState::Closed
            }
        }
    }

    struct EchoService;

    #[async_trait]
    impl IncomingRequestService for EchoService {
        async fn handle(&self, action: &str, payload: Value) -> OcppResult<Value> {
            if action == "Reset" {
                Ok(json!({"status": "Accepted"}))
            } else {
                Ok(payload)
            }
        }
    }

    async fn engine_with_channel(open: bool) -> (Arc<Engine>, Arc<MockChannel>) {
        let engine = Engine::new(OcppVersion::V16);
        let channel = MockChannel::new(open);
        engine.attach_channel(channel.clone()).await;
        engine.set_incoming_service(Arc::new(EchoService)).await;
        (engine, channel)
    }

    #[tokio::test]
    async fn call_resolves_on_call_result() {
        let (engine, channel) = engine_with_channel(true).await;

        let call_task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .call("Heartbeat", json!({}), CallOptions::default())
                    .await
            })
        };

        // Wait for the frame to hit the wire, then answer it.
        let sent = loop {
            let frames = channel.sent_frames();
            if let Some(frame) = frames.first() {
                break frame.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let Frame::Call { unique_id, .. } = Frame::parse(&sent).unwrap() else {
            panic!("expected call frame");
        };
        engine
            .handle_frame(
                &Frame::call_result(unique_id, json!({"currentTime": "2024-01-01T00:00:00Z"}))
                    .serialize(),
            )
            .await;

        let result = call_task.await.unwrap().unwrap();
        assert_eq!(result["currentTime"], "2024-01-01T00:00:00Z");
        assert_eq!(engine.pending_count(), 0);
        engine.with_statistics(|stats| {
            let cmd = stats.command("Heartbeat").unwrap();
            assert_eq!(cmd.request_count, 1);
            assert_eq!(cmd.response_count, 1);
        });
    }

    #[tokio::test]
    async fn call_rejects_on_call_error() {
        let (engine, channel) = engine_with_channel(true).await;

        let call_task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .call("BootNotification", json!({}), CallOptions::default())
                    .await
            })
        };

        let sent = loop {
            let frames = channel.sent_frames();
            if let Some(frame) = frames.first() {
                break frame.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let Frame::Call { unique_id, .. } = Frame::parse(&sent).unwrap() else {
            panic!("expected call frame");
        };
        let error = OcppError::internal("server exploded");
        engine
            .handle_frame(&Frame::call_error(unique_id, &error).serialize())
            .await;

        let result = call_task.await.unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.code, ocsim_types::OcppErrorCode::InternalError);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn response_timeout_rejects_with_generic_error() {
        let (engine, _channel) = engine_with_channel(true).await;
        let options = CallOptions {
            response_timeout: Duration::from_millis(20),
            ..Default::default()
        };

        let err = engine
            .call("Heartbeat", json!({}), options)
            .await
            .unwrap_err();
        assert_eq!(err.code, ocsim_types::OcppErrorCode::GenericError);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_buffers_and_flush_drains() {
        let (engine, channel) = engine_with_channel(false).await;

        let call_task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .call("Heartbeat", json!({}), CallOptions::default())
                    .await
            })
        };

        // Frame must land in the buffer, not on the wire.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.buffered_frame_count().await, 1);
        assert!(channel.sent_frames().is_empty());

        // Reopen and register, then flush.
        channel.open.store(true, Ordering::SeqCst);
        engine.set_registered(true);
        assert_eq!(engine.flush_buffer().await, 0);
        assert_eq!(channel.sent_frames().len(), 1);

        // Answer the flushed call so the caller resolves.
        let Frame::Call { unique_id, .. } = Frame::parse(&channel.sent_frames()[0]).unwrap()
        else {
            panic!("expected call frame");
        };
        engine
            .handle_frame(&Frame::call_result(unique_id, json!({})).serialize())
            .await;
        call_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_is_gated_on_registration() {
        let (engine, channel) = engine_with_channel(false).await;

        let _call_task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .call("Heartbeat", json!({}), CallOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.open.store(true, Ordering::SeqCst);
        // Not registered yet: flush must keep the frame.
        assert_eq!(engine.flush_buffer().await, 1);
        assert!(channel.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn skip_buffering_fails_fast_when_closed() {
        let (engine, _channel) = engine_with_channel(false).await;
        let options = CallOptions {
            skip_buffering_on_error: true,
            ..Default::default()
        };
        let err = engine
            .call("Heartbeat", json!({}), options)
            .await
            .unwrap_err();
        assert_eq!(err.code, ocsim_types::OcppErrorCode::GenericError);
        assert_eq!(engine.buffered_frame_count().await, 0);
    }

    #[tokio::test]
    async fn inbound_call_gets_call_result() {
        let (engine, channel) = engine_with_channel(true).await;
        engine
            .handle_frame(r#"[2,"msg-1","Reset",{"type":"Soft"}]"#)
            .await;

        let frames = channel.sent_frames();
        assert_eq!(frames.len(), 1);
        match Frame::parse(&frames[0]).unwrap() {
            Frame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "msg-1");
                assert_eq!(payload["status"], "Accepted");
            }
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_action_gets_call_error() {
        let (engine, channel) = engine_with_channel(true).await;
        engine
            .handle_frame(r#"[2,"msg-2","SignCertificate",{}]"#)
            .await;

        let frames = channel.sent_frames();
        assert_eq!(frames.len(), 1);
        match Frame::parse(&frames[0]).unwrap() {
            Frame::CallError { code, .. } => {
                assert_eq!(code, ocsim_types::OcppErrorCode::NotImplemented);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_silently() {
        let (engine, channel) = engine_with_channel(true).await;
        engine.handle_frame(r#"{"not":"an array"}"#).await;
        assert!(channel.sent_frames().is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_pending_rejects_all() {
        let (engine, _channel) = engine_with_channel(true).await;
        let call_task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .call("Heartbeat", json!({}), CallOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.pending_count(), 1);

        engine.fail_pending("station stopping");
        let err = call_task.await.unwrap().unwrap_err();
        assert!(err.description.contains("station stopping"));
        assert_eq!(engine.pending_count(), 0);
    }
}
