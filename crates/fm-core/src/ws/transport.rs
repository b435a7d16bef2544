//! Transport seam between the connection task and the actual socket.
//!
//! A [`Connector`] opens one physical connection and hands back its write half
//! ([`FrameSink`]) and read half ([`FrameSource`]). Production uses
//! [`TungsteniteConnector`](super::client::TungsteniteConnector); tests use the
//! in-memory [`ChannelConnector`](super::channel::ChannelConnector).

use async_trait::async_trait;

use crate::error::{FeedError, Result};

/// A frame read from the socket, reduced to what routing cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Text payload (binary payloads are decoded as UTF-8 by the transport).
    Text(String),
    /// Server ping; the connection task answers with a pong.
    Ping(Vec<u8>),
    /// The peer closed the socket. `clean` is false when the stream ended
    /// without a close handshake.
    Close { clean: bool },
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn send_ping(&mut self) -> Result<()>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<std::result::Result<WireFrame, FeedError>>;
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}
