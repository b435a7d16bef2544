//! tokio-tungstenite implementation of the transport traits.
//!
//! Each `connect` performs one TLS WebSocket handshake and splits the stream
//! into a sink and a source. Reconnecting is the caller's job.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::transport::{Connector, FrameSink, FrameSource, WireFrame};
use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens real WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let stream = connect_ws(url).await?;
        let (write, read) = stream.split();
        let source = TungsteniteSource {
            read,
            url: url.to_string(),
        };
        Ok((Box::new(TungsteniteSink { write }), Box::new(source)))
    }
}

/// Establish a (possibly TLS) WebSocket connection.
async fn connect_ws(url: &str) -> Result<WsStream> {
    check_ws_url(url)?;

    let request = url
        .into_client_request()
        .map_err(|e| FeedError::Config(format!("{url}: {e}")))?;

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| FeedError::WebSocket(e.to_string()))?;
    Ok(stream)
}

/// Reject anything that is not a ws:// or wss:// URL with a host.
fn check_ws_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| FeedError::Config(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(()),
        "ws" | "wss" => Err(FeedError::Config(format!("{url}: missing host"))),
        other => Err(FeedError::Config(format!("{url}: unsupported scheme {other}"))),
    }
}

struct TungsteniteSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.write.send(Message::Text(text.into())).await.map_err(ws_err)
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.write.send(Message::Ping(Vec::new().into())).await.map_err(ws_err)
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.write.send(Message::Pong(payload.into())).await.map_err(ws_err)
    }

    async fn close(&mut self) -> Result<()> {
        self.write.close().await.map_err(ws_err)
    }
}

struct TungsteniteSource {
    read: SplitStream<WsStream>,
    url: String,
}

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn next_frame(&mut self) -> Option<std::result::Result<WireFrame, FeedError>> {
        loop {
            let msg = match self.read.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ws_err(e))),
            };
            return Some(Ok(match msg {
                Message::Text(text) => WireFrame::Text(text.as_str().to_owned()),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => WireFrame::Text(text),
                    Err(_) => {
                        warn!(
                            "[ws {}] dropping non-UTF-8 binary frame ({} bytes)",
                            self.url,
                            data.len()
                        );
                        continue;
                    }
                },
                Message::Ping(payload) => WireFrame::Ping(payload.to_vec()),
                Message::Close(frame) => {
                    debug!("[ws {}] close frame: {frame:?}", self.url);
                    WireFrame::Close { clean: true }
                }
                Message::Pong(_) | Message::Frame(_) => continue,
            }));
        }
    }
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> FeedError {
    FeedError::WebSocket(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_check() {
        assert!(check_ws_url("wss://data.api.example/ws").is_ok());
        assert!(check_ws_url("ws://127.0.0.1:9000").is_ok());
        assert!(matches!(check_ws_url("https://data.api.example"), Err(FeedError::Config(_))));
        assert!(check_ws_url("not a url").is_err());
    }

    #[tokio::test]
    async fn bad_url_fails_before_dialing() {
        let connector = TungsteniteConnector::new();
        let err = connector.connect("https://127.0.0.1:1/ws").await.err();
        assert!(matches!(err, Some(FeedError::Config(_))));
    }
}
