use anyhow::{bail, Context, Result};
use core_types::{
    validate_room, ClientError, IceCandidate, IceServer, NegotiationEvent, Negotiator,
    NegotiatorFactory, RemoteTrack, RenderTarget, SessionDescription,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelSender, Connector};
use crate::message::SignalingMessage;

/// シグナリングクライアント
///
/// ルームへの参加ごとにチャンネルとネゴシエーションオブジェクトを1つずつ作り、
/// それらを所有する `Session` を返す。
pub struct SignalingClient {
    connector: Arc<dyn Connector>,
    negotiator_factory: Arc<dyn NegotiatorFactory>,
    render_target: Arc<dyn RenderTarget>,
    ice_servers: Vec<IceServer>,
}

impl SignalingClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        negotiator_factory: Arc<dyn NegotiatorFactory>,
        render_target: Arc<dyn RenderTarget>,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        Self {
            connector,
            negotiator_factory,
            render_target,
            ice_servers,
        }
    }

    /// ルームに参加する
    ///
    /// ルーム名が空なら `ClientError::InvalidInput` で失敗し、チャンネルも
    /// ネゴシエーションオブジェクトも作らない。
    pub async fn join(&self, room: &str) -> Result<Session> {
        let room = validate_room(room)?;
        if self.ice_servers.is_empty() {
            warn!("No ICE servers configured, only host candidates will be gathered");
        }

        info!("Joining room: {}", room);

        let Channel { sender, events } = self.connector.open();

        // ハンドラはファクトリ内で登録され、イベントはこのキューに届く
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();
        let negotiator = self
            .negotiator_factory
            .create(&self.ice_servers, negotiation_tx)
            .await
            .context("Failed to create negotiation object")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (joined_tx, joined_rx) = watch::channel(false);
        let driver = SessionDriver {
            room: room.clone(),
            channel: sender.clone(),
            channel_events: events,
            negotiation_events: negotiation_rx,
            negotiator,
            render_target: self.render_target.clone(),
            joined_tx,
            active_stream: None,
            shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        Ok(Session {
            room,
            channel: sender,
            joined_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

/// 1回の参加に対応するセッション
///
/// 破棄するとセッションループも停止する。
pub struct Session {
    room: String,
    channel: ChannelSender,
    joined_rx: watch::Receiver<bool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl Session {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// チャンネルが開いていて join 送信済みか
    pub fn is_open(&self) -> bool {
        *self.joined_rx.borrow() && self.channel.is_open()
    }

    /// join を送るまで待つ。その前にセッションが終わった場合は false
    ///
    /// 戻り値の Future はセッションを借用しない。
    pub fn wait_open(&self) -> impl Future<Output = bool> + Send + 'static {
        let mut joined_rx = self.joined_rx.clone();
        let channel = self.channel.clone();
        async move {
            let joined = joined_rx.wait_for(|joined| *joined).await.is_ok();
            joined && channel.is_open()
        }
    }

    /// セッションループが終了しているか
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// アバターの生成開始を要求する
    pub fn request_avatar(&self) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotReady);
        }
        self.channel
            .send(&SignalingMessage::StartAvatar)
            .map_err(|e| {
                warn!("Failed to send start-avatar: {:#}", e);
                ClientError::NotReady
            })?;
        info!("Avatar requested (room: {})", self.room);
        Ok(())
    }

    /// セッションを停止し、ループの終了を待つ
    pub async fn close(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }

    /// セッションループの終了を待つ
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("Session task failed")?
    }
}

/// セッションループ本体
///
/// 受信メッセージは1つずつ処理し、記述の作成・適用を含む処理が完了するまで
/// 次のメッセージを読まない。
struct SessionDriver {
    room: String,
    channel: ChannelSender,
    channel_events: mpsc::Receiver<ChannelEvent>,
    negotiation_events: mpsc::UnboundedReceiver<NegotiationEvent>,
    negotiator: Arc<dyn Negotiator>,
    render_target: Arc<dyn RenderTarget>,
    joined_tx: watch::Sender<bool>,
    active_stream: Option<String>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl SessionDriver {
    async fn run(mut self) -> Result<()> {
        info!("Session started (room: {})", self.room);

        let result = self.event_loop().await;

        if let Err(e) = self.negotiator.close().await {
            warn!("Failed to close negotiation object: {}", e);
        }
        match &result {
            Ok(()) => info!("Session stopped (room: {})", self.room),
            Err(e) => warn!("Session aborted (room: {}): {:#}", self.room, e),
        }
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!("Session shutdown requested");
                    return Ok(());
                }
                event = self.channel_events.recv() => match event {
                    Some(ChannelEvent::Open) => self.on_open()?,
                    Some(ChannelEvent::Message(text)) => self.on_message(&text).await?,
                    Some(ChannelEvent::Closed) | None => {
                        info!("Signaling channel closed");
                        return Ok(());
                    }
                },
                Some(event) = self.negotiation_events.recv() => {
                    self.on_negotiation_event(event).await?;
                }
            }
        }
    }

    fn on_open(&mut self) -> Result<()> {
        if *self.joined_tx.borrow() {
            debug!("Channel reported open twice, ignoring");
            return Ok(());
        }
        self.channel.send(&SignalingMessage::Join {
            room: self.room.clone(),
        })?;
        self.joined_tx.send_replace(true);
        info!("Join sent (room: {})", self.room);
        Ok(())
    }

    async fn on_message(&mut self, text: &str) -> Result<()> {
        let message: SignalingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                // JSON オブジェクトでさえないものだけをプロトコル違反とする
                let value: serde_json::Value = serde_json::from_str(text)
                    .with_context(|| format!("Malformed signaling message: {}", text))?;
                if !value.is_object() {
                    bail!("Malformed signaling message: {}", text);
                }
                warn!(
                    "{} ({})",
                    ClientError::UnrecognizedMessage(text.to_string()),
                    e
                );
                return Ok(());
            }
        };
        debug!("Received {} message", message.action());

        match message {
            // どちらも「こちらが記述を提案する番」
            SignalingMessage::Ready | SignalingMessage::Renegotiate => self.send_offer().await,
            SignalingMessage::Offer { sdp, sdp_type } => {
                self.negotiator
                    .set_remote_description(SessionDescription::new(sdp_type, sdp))
                    .await
                    .context("Failed to set remote description")?;
                self.send_answer().await
            }
            SignalingMessage::Answer { sdp, sdp_type } => {
                self.negotiator
                    .set_remote_description(SessionDescription::new(sdp_type, sdp))
                    .await
                    .context("Failed to set remote description")?;
                info!("Remote answer applied");
                Ok(())
            }
            SignalingMessage::IceCandidate {
                candidate: Some(value),
            } => {
                let candidate = match serde_json::from_value::<IceCandidate>(value) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!("{}", ClientError::CandidateRejected(e.to_string()));
                        return Ok(());
                    }
                };
                if let Err(e) = self.negotiator.add_ice_candidate(candidate).await {
                    warn!("{}", ClientError::CandidateRejected(format!("{:#}", e)));
                } else {
                    debug!("Remote ICE candidate added");
                }
                Ok(())
            }
            SignalingMessage::IceCandidate { candidate: None } => {
                debug!("Remote end-of-candidates received");
                Ok(())
            }
            // client → relay 専用のメッセージを受け取った
            SignalingMessage::Join { .. }
            | SignalingMessage::StartAvatar
            | SignalingMessage::Unknown => {
                warn!("{}", ClientError::UnrecognizedMessage(text.to_string()));
                Ok(())
            }
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self
            .negotiator
            .create_offer()
            .await
            .context("Failed to create offer")?;
        self.negotiator
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;

        let local = self.negotiator.local_description().await.unwrap_or(offer);
        self.channel.send(&SignalingMessage::offer(local))?;
        info!("Offer sent");
        Ok(())
    }

    async fn send_answer(&mut self) -> Result<()> {
        let answer = self
            .negotiator
            .create_answer()
            .await
            .context("Failed to create answer")?;
        self.negotiator
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;

        let local = self.negotiator.local_description().await.unwrap_or(answer);
        self.channel.send(&SignalingMessage::answer(local))?;
        info!("Answer sent");
        Ok(())
    }

    async fn on_negotiation_event(&mut self, event: NegotiationEvent) -> Result<()> {
        match event {
            NegotiationEvent::LocalCandidate(Some(candidate)) => {
                debug!("Local ICE candidate: {}", candidate.candidate);
                self.channel
                    .send(&SignalingMessage::ice_candidate(candidate))?;
            }
            NegotiationEvent::LocalCandidate(None) => {
                debug!("Local ICE gathering complete");
            }
            NegotiationEvent::Track(track) => {
                if let Err(e) = self.on_track(track).await {
                    warn!("Failed to render remote track: {:#}", e);
                }
            }
        }
        Ok(())
    }

    async fn on_track(&mut self, track: Arc<dyn RemoteTrack>) -> Result<()> {
        let stream_id = track.stream_id();
        info!(
            "Track received: {} (stream: {}, kind: {:?})",
            track.track_id(),
            stream_id,
            track.kind()
        );

        if self.active_stream.as_deref() != Some(stream_id.as_str()) {
            self.render_target.bind_stream(&stream_id).await?;
            self.active_stream = Some(stream_id);
        }
        self.render_target.attach_track(track).await
    }
}
