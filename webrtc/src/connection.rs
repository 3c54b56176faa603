use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use core_types::{
    IceCandidate, IceServer, MediaKind, NegotiationEvent, Negotiator, NegotiatorFactory,
    RemoteTrack, SdpType, SessionDescription,
};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use webrtc_rs::api::interceptor_registry::register_default_interceptors;
use webrtc_rs::api::media_engine::MediaEngine;
use webrtc_rs::api::APIBuilder;
use webrtc_rs::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc_rs::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc_rs::ice_transport::ice_server::RTCIceServer;
use webrtc_rs::interceptor::registry::Registry;
use webrtc_rs::peer_connection::configuration::RTCConfiguration;
use webrtc_rs::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc_rs::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc_rs::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc_rs::peer_connection::RTCPeerConnection;
use webrtc_rs::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc_rs::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc_rs::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc_rs::track::track_remote::TrackRemote;

/// IceServer を webrtc-rs の設定に変換
pub fn to_rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
    ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

pub fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = desc.sdp;
            return Ok(rollback);
        }
    };
    rtc.context("Failed to parse SDP")
}

pub fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => bail!("Session description has no type"),
    };
    Ok(SessionDescription::new(sdp_type, desc.sdp))
}

/// ローカル候補をシグナリング用の形に変換
pub fn to_ice_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidate> {
    let init = candidate
        .to_json()
        .context("Failed to serialize ICE candidate")?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

/// webrtc-rs の受信トラック
pub struct WebRtcTrack {
    track: Arc<TrackRemote>,
}

impl WebRtcTrack {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }

    pub fn inner(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl RemoteTrack for WebRtcTrack {
    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn track_id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> MediaKind {
        match self.track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Unknown,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// RTCPeerConnection を包んだネゴシエーションオブジェクト
pub struct PeerNegotiator {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl Negotiator for PeerNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        debug!("Offer SDP generated:\n{}", offer.sdp);
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        debug!("Answer SDP generated:\n{}", answer.sdp);
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        debug!("Remote {} SDP received:\n{}", desc.sdp_type, desc.sdp);
        self.pc
            .set_remote_description(desc)
            .await
            .context("Failed to set remote description")
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        match from_rtc_description(desc) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!("Ignoring local description: {}", e);
                None
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!("AddIceCandidate received");
        let ice_candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(ice_candidate)
            .await
            .context("Failed to add ICE candidate")?;
        debug!("ICE candidate added");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

/// PeerNegotiator のファクトリ
pub struct PeerNegotiatorFactory {
    receive_audio: bool,
}

impl PeerNegotiatorFactory {
    /// 映像のみ受信する
    pub fn new() -> Self {
        Self {
            receive_audio: false,
        }
    }

    /// 音声も受信する
    pub fn with_audio(mut self, receive_audio: bool) -> Self {
        self.receive_audio = receive_audio;
        self
    }
}

impl Default for PeerNegotiatorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NegotiatorFactory for PeerNegotiatorFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: UnboundedSender<NegotiationEvent>,
    ) -> Result<Arc<dyn Negotiator>> {
        let pc = self.new_peer_connection(ice_servers).await?;
        register_handlers(&pc, events);
        Ok(Arc::new(PeerNegotiator { pc }))
    }
}

impl PeerNegotiatorFactory {
    async fn new_peer_connection(&self, ice_servers: &[IceServer]) -> Result<Arc<RTCPeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        // ローカルトラックは持たないので、受信専用の m-line を用意しておく
        let mut kinds = vec![RTPCodecType::Video];
        if self.receive_audio {
            kinds.push(RTPCodecType::Audio);
        }
        for kind in kinds {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .with_context(|| format!("Failed to add {} transceiver", kind))?;
        }

        info!(
            "PeerConnection created ({} ICE servers, audio: {})",
            ice_servers.len(),
            self.receive_audio
        );
        Ok(pc)
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: UnboundedSender<NegotiationEvent>) {
    // ローカル候補はそのままセッションへ渡す（end-of-candidates も含む）
    let events_ice = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = events_ice.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match to_ice_candidate(&candidate) {
                    Ok(candidate) => Some(candidate),
                    Err(e) => {
                        warn!("Dropping local ICE candidate: {:#}", e);
                        return;
                    }
                },
                None => None,
            };
            if events.send(NegotiationEvent::LocalCandidate(candidate)).is_err() {
                debug!("Session is gone, ICE candidate dropped");
            }
        })
    }));

    let events_track = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = events_track.clone();
        Box::pin(async move {
            info!(
                "Track received: {} ({})",
                track.kind(),
                track.codec().capability.mime_type
            );
            let track: Arc<dyn RemoteTrack> = Arc::new(WebRtcTrack::new(track));
            if events.send(NegotiationEvent::Track(track)).is_err() {
                debug!("Session is gone, track dropped");
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => {
                    info!("PeerConnection state: Connected - Media stream should be active");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!("PeerConnection state: Disconnected - Connection lost");
                }
                RTCPeerConnectionState::Failed => {
                    error!("PeerConnection state: Failed - Connection failed");
                }
                other => {
                    info!("PeerConnection state: {}", other);
                }
            }
        })
    }));

    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        Box::pin(async move {
            match state {
                RTCIceConnectionState::Failed => {
                    error!("ICE connection state: Failed - ICE connection failed");
                }
                RTCIceConnectionState::Disconnected => {
                    warn!("ICE connection state: Disconnected - ICE connection lost");
                }
                other => {
                    info!("ICE connection state: {}", other);
                }
            }
        })
    }));
}
