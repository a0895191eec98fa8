//! # Message Channel Abstraction
//!
//! The station core talks to its Central System through the [`MessageChannel`]
//! trait: a bidirectional text-frame pipe with ping support. The production
//! implementation is the WebSocket channel in [`websocket`]; tests substitute
//! an in-memory double.

pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("channel is not open")]
    NotOpen,

    #[error("send failed: {0}")]
    Send(String),

    #[error("channel closed: {reason}")]
    Closed { reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid supervision URL: {0}")]
    InvalidUrl(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events surfaced by a channel to its owner.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Handshake completed; `subprotocol` is the one the server picked.
    Opened { subprotocol: Option<String> },
    /// An inbound text frame.
    MessageReceived(String),
    /// The peer answered one of our pings.
    PongReceived,
    /// The channel went down; `clean` distinguishes a requested close from a
    /// transport failure.
    Closed { reason: String, clean: bool },
}

/// Channel tuning knobs.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: std::time::Duration,
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: std::time::Duration::from_secs(30),
            max_message_size: 64 * 1024,
        }
    }
}

/// A bidirectional text-frame channel to the Central System.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send one text frame. Fails with `NotOpen` when the channel is down.
    async fn send(&self, text: String) -> TransportResult<()>;

    /// Send a WebSocket-level ping.
    async fn ping(&self) -> TransportResult<()>;

    /// Close the channel cleanly.
    async fn close(&self) -> TransportResult<()>;

    /// Current connection state.
    fn state(&self) -> ChannelState;
}

/// Receiver half handed to the channel owner at connect time.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.connect_timeout, std::time::Duration::from_secs(30));
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::MessageTooLarge {
            size: 100,
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "message of 100 bytes exceeds the 10 byte limit"
        );
    }
}
