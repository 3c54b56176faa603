use anyhow::{Context, Result};
use core_types::ClientError;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::message::SignalingMessage;

const INBOUND_CAPACITY: usize = 100;

/// チャンネルの接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// チャンネルからセッションへ届くイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// リレーへの送信側ハンドル
#[derive(Debug, Clone)]
pub struct ChannelSender {
    outbound_tx: mpsc::UnboundedSender<String>,
    state_rx: watch::Receiver<ChannelState>,
}

impl ChannelSender {
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// JSONにエンコードして1フレーム送信キューへ積む
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::NotReady.into());
        }
        let json = serde_json::to_string(message).context("Failed to encode signaling message")?;
        self.outbound_tx
            .send(json)
            .map_err(|_| anyhow::Error::from(ClientError::NotReady))
            .with_context(|| format!("Failed to send {} message", message.action()))?;
        debug!("Sent {} message", message.action());
        Ok(())
    }
}

/// 開いたばかりのチャンネル
pub struct Channel {
    pub sender: ChannelSender,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// チャンネルを開く手段
pub trait Connector: Send + Sync {
    /// 接続はバックグラウンドで確立され、完了時に ChannelEvent::Open が届く
    fn open(&self) -> Channel;
}

/// WebSocket でリレーに接続する
pub struct WebSocketConnector {
    endpoint: Url,
}

impl WebSocketConnector {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

impl Connector for WebSocketConnector {
    fn open(&self) -> Channel {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);

        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = run_websocket(endpoint, outbound_rx, event_tx.clone(), &state_tx).await
            {
                error!("Signaling channel error: {:#}", e);
            }
            state_tx.send_replace(ChannelState::Closed);
            let _ = event_tx.send(ChannelEvent::Closed).await;
        });

        Channel {
            sender: ChannelSender {
                outbound_tx,
                state_rx,
            },
            events: event_rx,
        }
    }
}

async fn run_websocket(
    endpoint: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::Sender<ChannelEvent>,
    state_tx: &watch::Sender<ChannelState>,
) -> Result<()> {
    info!("Connecting to WebSocket: {}", endpoint);

    let (ws_stream, _) = connect_async(endpoint.as_str())
        .await
        .context("Failed to connect to WebSocket")?;

    info!("WebSocket connected");
    state_tx.send_replace(ChannelState::Open);
    if event_tx.send(ChannelEvent::Open).await.is_err() {
        // セッション側が既に終了している
        return Ok(());
    }

    let (mut write, mut read) = ws_stream.split();

    // セッションからの送信要求をWebSocketに書き込むタスク
    let mut write_handle = tokio::spawn(async move {
        while let Some(json) = outbound_rx.recv().await {
            if let Err(e) = write.send(WsMessage::Text(json)).await {
                error!("Failed to send message to WebSocket: {}", e);
                break;
            }
        }
        // 送信側が全て破棄されたら閉じる
        let _ = write.send(WsMessage::Close(None)).await;
        let _ = write.close().await;
    });

    // WebSocketからのメッセージを受信してセッションへ転送するタスク
    let mut recv_handle = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    debug!("Received message: {}", text);
                    if event_tx.send(ChannelEvent::Message(text)).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    info!("WebSocket closed by server");
                    break;
                }
                Ok(_) => {
                    debug!("Received non-text message");
                }
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    // どちらかのタスクが終了するまで待機
    tokio::select! {
        result = &mut write_handle => {
            if let Err(e) = result {
                error!("Write task error: {}", e);
            }
        }
        result = &mut recv_handle => {
            if let Err(e) = result {
                error!("Receive task error: {}", e);
            }
        }
    }
    write_handle.abort();
    recv_handle.abort();

    info!("WebSocket connection finished");
    Ok(())
}

/// プロセス内のリレー（テストやローカル実行用）
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// MemoryConnector が開いたチャンネルのリレー側
    pub struct RelayEnd {
        outbound_rx: mpsc::UnboundedReceiver<String>,
        event_tx: mpsc::Sender<ChannelEvent>,
        state_tx: watch::Sender<ChannelState>,
    }

    impl RelayEnd {
        /// 接続完了を通知する
        pub async fn open(&self) -> Result<()> {
            self.state_tx.send_replace(ChannelState::Open);
            self.event_tx
                .send(ChannelEvent::Open)
                .await
                .context("Session is gone")
        }

        pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
            self.send_text(serde_json::to_string(message)?).await
        }

        pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
            self.event_tx
                .send(ChannelEvent::Message(text.into()))
                .await
                .context("Session is gone")
        }

        /// クライアントが送信した次のメッセージ
        pub async fn recv(&mut self) -> Option<SignalingMessage> {
            let json = self.outbound_rx.recv().await?;
            match serde_json::from_str(&json) {
                Ok(message) => Some(message),
                Err(e) => {
                    error!("Client sent malformed message: {}", e);
                    None
                }
            }
        }

        /// 既に届いているメッセージを全て取り出す
        pub fn drain(&mut self) -> Vec<SignalingMessage> {
            let mut messages = Vec::new();
            while let Ok(json) = self.outbound_rx.try_recv() {
                if let Ok(message) = serde_json::from_str(&json) {
                    messages.push(message);
                }
            }
            messages
        }

        pub async fn close(&self) {
            self.state_tx.send_replace(ChannelState::Closed);
            let _ = self.event_tx.send(ChannelEvent::Closed).await;
        }
    }

    /// プロセス内チャンネルを開くコネクタ
    #[derive(Clone)]
    pub struct MemoryConnector {
        relay_tx: mpsc::UnboundedSender<RelayEnd>,
        opened: Arc<AtomicUsize>,
    }

    impl MemoryConnector {
        /// 開かれたチャンネルのリレー側は戻り値の Receiver に届く
        pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEnd>) {
            let (relay_tx, relay_rx) = mpsc::unbounded_channel();
            (
                Self {
                    relay_tx,
                    opened: Arc::new(AtomicUsize::new(0)),
                },
                relay_rx,
            )
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    impl Connector for MemoryConnector {
        fn open(&self) -> Channel {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);
            let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);

            self.opened.fetch_add(1, Ordering::SeqCst);
            if self
                .relay_tx
                .send(RelayEnd {
                    outbound_rx,
                    event_tx,
                    state_tx,
                })
                .is_err()
            {
                warn!("No relay is listening on the memory connector");
            }

            Channel {
                sender: ChannelSender {
                    outbound_tx,
                    state_rx,
                },
                events: event_rx,
            }
        }
    }
}
