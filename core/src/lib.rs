use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// クライアントが能動的に扱うエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// ルーム名が空（空白のみを含む）
    #[error("Please enter a room name")]
    InvalidInput,
    /// チャンネルがまだ開いていない
    #[error("You must join a room first")]
    NotReady,
    /// ネゴシエーションオブジェクトがリモート候補を拒否した
    #[error("Failed to add ICE candidate: {0}")]
    CandidateRejected(String),
    /// 未知の action を持つメッセージ
    #[error("Unhandled signaling message: {0}")]
    UnrecognizedMessage(String),
}

/// ルーム名を検証し、前後の空白を除去したものを返す
pub fn validate_room(room: &str) -> Result<String, ClientError> {
    let room = room.trim();
    if room.is_empty() {
        return Err(ClientError::InvalidInput);
    }
    Ok(room.to_string())
}

/// SDPの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// セッション記述（SDP本文と種類）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }
}

/// ネットワーク候補（ブラウザの RTCIceCandidateInit と同じJSON形）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// STUN/TURN サーバー設定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// 既定の公開STUNサーバー
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// メディアの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

/// 受信したリモートトラック
pub trait RemoteTrack: Send + Sync {
    /// トラックが属するストリームのID
    fn stream_id(&self) -> String;
    fn track_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// 実装固有の型へダウンキャストするため
    fn as_any(&self) -> &dyn Any;
}

/// ネゴシエーションオブジェクトから通知されるイベント
pub enum NegotiationEvent {
    /// ローカル候補の発見（None は end-of-candidates）
    LocalCandidate(Option<IceCandidate>),
    /// リモートメディアトラックの到着
    Track(Arc<dyn RemoteTrack>),
}

impl fmt::Debug for NegotiationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            NegotiationEvent::Track(t) => f
                .debug_struct("Track")
                .field("stream_id", &t.stream_id())
                .field("track_id", &t.track_id())
                .field("kind", &t.kind())
                .finish(),
        }
    }
}

/// ピア接続のネゴシエーションオブジェクト
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    /// 現在のローカル記述（未設定なら None）
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// ネゴシエーションオブジェクトのファクトリ
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// 新しいネゴシエーションオブジェクトを作成し、イベントハンドラを登録する
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: UnboundedSender<NegotiationEvent>,
    ) -> anyhow::Result<Arc<dyn Negotiator>>;
}

/// 受信メディアの描画先
#[async_trait]
pub trait RenderTarget: Send + Sync {
    /// ストリームをアクティブソースにする
    async fn bind_stream(&self, stream_id: &str) -> anyhow::Result<()>;
    /// アクティブストリームにトラックを追加する
    async fn attach_track(&self, track: Arc<dyn RemoteTrack>) -> anyhow::Result<()>;
}
