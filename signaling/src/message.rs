use core_types::{IceCandidate, SdpType, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// シグナリングメッセージ（リレー経由で送受信）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// client → relay
    Join { room: String },
    /// client → relay
    StartAvatar,
    /// relay → client
    Ready,
    /// relay → client
    Renegotiate,
    Offer {
        sdp: String,
        #[serde(rename = "type")]
        sdp_type: SdpType,
    },
    Answer {
        sdp: String,
        #[serde(rename = "type")]
        sdp_type: SdpType,
    },
    IceCandidate {
        /// null はリモート側の end-of-candidates。
        /// 中身はネゴシエーションオブジェクトに渡すまで解釈しない
        candidate: Option<Value>,
    },
    /// 未知の action
    #[serde(other)]
    Unknown,
}

impl SignalingMessage {
    pub fn offer(desc: SessionDescription) -> Self {
        SignalingMessage::Offer {
            sdp: desc.sdp,
            sdp_type: desc.sdp_type,
        }
    }

    pub fn answer(desc: SessionDescription) -> Self {
        SignalingMessage::Answer {
            sdp: desc.sdp,
            sdp_type: desc.sdp_type,
        }
    }

    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            candidate: serde_json::to_value(candidate).ok(),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::StartAvatar => "start-avatar",
            SignalingMessage::Ready => "ready",
            SignalingMessage::Renegotiate => "renegotiate",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Unknown => "unknown",
        }
    }
}
