// SignalingClient: WebSocketでリレーに接続し、ネゴシエーションを仲介する
pub mod channel;
pub mod client;
pub mod endpoint;
pub mod message;

pub use channel::{
    Channel, ChannelEvent, ChannelSender, ChannelState, Connector, WebSocketConnector,
};
pub use client::{Session, SignalingClient};
pub use endpoint::signaling_endpoint;
pub use message::SignalingMessage;
