//! In-memory transport.
//!
//! [`ChannelConnector`] implements [`Connector`] over tokio channels. Every
//! successful `connect` hands a [`ChannelPeer`] to the paired
//! [`ChannelListener`]; the peer plays the server side of that one socket. It
//! can push frames, close cleanly, vanish without a handshake, or inject read
//! errors. Used by the multiplexer and broker tests and for offline runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{Connector, FrameSink, FrameSource, WireFrame};
use crate::error::{FeedError, Result};

/// What the client wrote to a [`ChannelPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Pong(Vec<u8>),
    Close,
}

type Inbound = std::result::Result<WireFrame, FeedError>;

/// Client side of the in-memory transport.
#[derive(Clone)]
pub struct ChannelConnector {
    accept_tx: mpsc::UnboundedSender<ChannelPeer>,
    refusals: Arc<AtomicU32>,
    connects: Arc<AtomicU32>,
}

/// Receives one [`ChannelPeer`] per accepted connection.
pub struct ChannelListener {
    accept_rx: mpsc::UnboundedReceiver<ChannelPeer>,
}

impl ChannelConnector {
    pub fn new() -> (Self, ChannelListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            refusals: Arc::new(AtomicU32::new(0)),
            connects: Arc::new(AtomicU32::new(0)),
        };
        (connector, ChannelListener { accept_rx })
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!("[channel] refusing connection to {url}");
            return Err(FeedError::WebSocket(format!("{url}: connection refused")));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = ChannelPeer {
            url: url.to_string(),
            outbound: out_rx,
            inbound: in_tx,
        };
        self.accept_tx.send(peer).map_err(|_| FeedError::WebSocket(format!("{url}: no listener")))?;

        Ok((Box::new(ChannelSink { tx: out_tx }), Box::new(ChannelSource { rx: in_rx })))
    }
}

impl ChannelListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<ChannelPeer> {
        self.accept_rx.recv().await
    }

    /// Next already-established connection, if any.
    pub fn try_accept(&mut self) -> Option<ChannelPeer> {
        self.accept_rx.try_recv().ok()
    }
}

/// Server side of one in-memory connection.
pub struct ChannelPeer {
    url: String,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl ChannelPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(WireFrame::Text(text.into())));
    }

    /// Push a JSON value as a text frame.
    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(value.to_string());
    }

    pub fn send_ping(&self, payload: Vec<u8>) {
        let _ = self.inbound.send(Ok(WireFrame::Ping(payload)));
    }

    /// Inject a read error.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.inbound.send(Err(FeedError::WebSocket(message.into())));
    }

    /// Close with a handshake.
    pub fn close_clean(self) {
        let _ = self.inbound.send(Ok(WireFrame::Close { clean: true }));
    }

    /// Disappear without a close handshake.
    pub fn drop_unclean(self) {
        drop(self);
    }

    /// Next frame written by the client, or `None` once the client dropped
    /// its sink.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }

    /// Next text frame written by the client, skipping keep-alive traffic.
    /// `None` if the client closed or dropped the socket first.
    pub async fn expect_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                OutboundFrame::Text(text) => return Some(text),
                OutboundFrame::Ping | OutboundFrame::Pong(_) => continue,
                OutboundFrame::Close => return None,
            }
        }
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ChannelSink {
    fn push(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.send(frame).map_err(|_| FeedError::WebSocket("peer gone".into()))
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.push(OutboundFrame::Text(text))
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.push(OutboundFrame::Ping)
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.push(OutboundFrame::Pong(payload))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.tx.send(OutboundFrame::Close);
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}
