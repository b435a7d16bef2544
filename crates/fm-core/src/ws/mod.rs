//! WebSocket connection multiplexing with reconnect and keep-alive.

pub mod channel;
pub mod client;
mod connection;
pub mod multiplexer;
pub mod reconnect;
pub mod transport;

pub use channel::{ChannelConnector, ChannelListener, ChannelPeer, OutboundFrame};
pub use client::TungsteniteConnector;
pub use multiplexer::{
    ConnectionMultiplexer, MessageFilter, MuxConfig, StreamEvent, SubscriptionHandle,
    SubscriptionSpec,
};
pub use reconnect::{ReconnectPolicy, ReconnectionManager};
pub use transport::{Connector, FrameSink, FrameSource, WireFrame};
