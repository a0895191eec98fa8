//! WebSocket implementation of the message channel
//!
//! Connects to `<supervisionUrl>/<stationId>` with the OCPP subprotocol and
//! optional HTTP Basic credentials, then splits the stream: a background read
//! loop forwards inbound frames and close events to the owner while the write
//! half is shared behind a mutex.

use crate::{
    ChannelConfig, ChannelEvent, ChannelEvents, ChannelState, MessageChannel, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Join the supervision URL and station id into the connection endpoint.
pub fn station_endpoint(supervision_url: &str, station_id: &str) -> TransportResult<Url> {
    let base = supervision_url.trim_end_matches('/');
    Url::parse(&format!("{base}/{station_id}"))
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))
}

/// WebSocket channel to a Central System.
pub struct WebSocketChannel {
    writer: Arc<Mutex<WsSink>>,
    state: Arc<RwLock<ChannelState>>,
    config: ChannelConfig,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WebSocketChannel {
    /// Open the channel. Returns the channel plus the event receiver carrying
    /// inbound frames and the eventual close notification.
    pub async fn connect(
        endpoint: &Url,
        subprotocol: &str,
        credentials: Option<(&str, &str)>,
        config: ChannelConfig,
    ) -> TransportResult<(Self, ChannelEvents)> {
        info!(%endpoint, subprotocol, "connecting to central system");

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(subprotocol)
                .map_err(|e| TransportError::Connect(e.to_string()))?,
        );
        if let Some((user, password)) = credentials {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Basic {token}"))
                    .map_err(|e| TransportError::Connect(e.to_string()))?,
            );
        }

        let (stream, response) = timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(config.connect_timeout))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);
        debug!(?negotiated, "websocket handshake complete");

        let (write, read) = stream.split();
        let writer = Arc::new(Mutex::new(write));
        let state = Arc::new(RwLock::new(ChannelState::Open));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ChannelEvent::Opened {
            subprotocol: negotiated,
        });

        let reader_handle = tokio::spawn(Self::read_loop(
            read,
            Arc::clone(&writer),
            Arc::clone(&state),
            event_tx,
            config.max_message_size,
        ));

        Ok((
            Self {
                writer,
                state,
                config,
                reader_handle,
            },
            event_rx,
        ))
    }

    async fn read_loop(
        mut read: SplitStream<WsStream>,
        writer: Arc<Mutex<WsSink>>,
        state: Arc<RwLock<ChannelState>>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        max_message_size: usize,
    ) {
        let (reason, clean) = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > max_message_size {
                        warn!(
                            size = text.len(),
                            limit = max_message_size,
                            "dropping oversized inbound frame"
                        );
                        continue;
                    }
                    if events.send(ChannelEvent::MessageReceived(text)).is_err() {
                        break ("owner dropped".to_string(), true);
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    debug!("ping received, answering with pong");
                    let mut w = writer.lock().await;
                    if let Err(e) = w.send(Message::Pong(data)).await {
                        break (format!("pong failed: {e}"), false);
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = events.send(ChannelEvent::PongReceived);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "close frame".to_string());
                    break (reason, true);
                }
                Some(Ok(other)) => {
                    warn!(?other, "ignoring unsupported frame type");
                }
                Some(Err(e)) => break (e.to_string(), false),
                None => break ("stream ended".to_string(), false),
            }
        };

        *state.write().unwrap_or_else(|p| p.into_inner()) = ChannelState::Closed;
        info!(%reason, clean, "channel closed");
        let _ = events.send(ChannelEvent::Closed { reason, clean });
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn send(&self, text: String) -> TransportResult<()> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        if text.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: text.len(),
                limit: self.config.max_message_size,
            });
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&self) -> TransportResult<()> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            if *state == ChannelState::Closed {
                return Ok(());
            }
            *state = ChannelState::Closing;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.flush().await;
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = ChannelState::Closed;
        Ok(())
    }

    fn state(&self) -> ChannelState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}
