#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use core_types::{
    IceCandidate, IceServer, MediaKind, NegotiationEvent, Negotiator, NegotiatorFactory,
    RemoteTrack, RenderTarget, SdpType, SessionDescription,
};
use signaling::channel::memory::{MemoryConnector, RelayEnd};
use signaling::SignalingClient;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

/// FakeNegotiator が受けた呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

pub struct FakeNegotiator {
    calls: Mutex<Vec<Call>>,
    local: Mutex<Option<SessionDescription>>,
    counter: AtomicUsize,
    reject_candidates: bool,
    delay: Duration,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
}

impl FakeNegotiator {
    fn new(reject_candidates: bool, delay: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            counter: AtomicUsize::new(0),
            reject_candidates,
            delay,
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// 記述操作が並行に走ったことがあるか
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn suspend(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateOffer);
        self.suspend().await;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::new(SdpType::Offer, format!("fake-offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        self.suspend().await;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::new(SdpType::Answer, format!("fake-answer-{}", n)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetLocal(desc.clone()));
        self.suspend().await;
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetRemote(desc));
        self.suspend().await;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate));
        if self.reject_candidates {
            bail!("remote candidate rejected");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    reject_candidates: bool,
    delay: Duration,
    negotiators: Mutex<Vec<Arc<FakeNegotiator>>>,
    events: Mutex<Vec<mpsc::UnboundedSender<NegotiationEvent>>>,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl FakeFactory {
    pub fn rejecting_candidates() -> Self {
        Self {
            reject_candidates: true,
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn created(&self) -> usize {
        self.negotiators.lock().unwrap().len()
    }

    pub fn negotiator(&self) -> Arc<FakeNegotiator> {
        self.negotiators.lock().unwrap().last().cloned().unwrap()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.lock().unwrap().clone()
    }

    /// ネゴシエーションオブジェクト側のイベントを発火する
    pub fn emit(&self, event: NegotiationEvent) {
        let events = self.events.lock().unwrap();
        events.last().unwrap().send(event).unwrap();
    }
}

#[async_trait]
impl NegotiatorFactory for FakeFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<NegotiationEvent>,
    ) -> Result<Arc<dyn Negotiator>> {
        let negotiator = Arc::new(FakeNegotiator::new(self.reject_candidates, self.delay));
        self.negotiators.lock().unwrap().push(negotiator.clone());
        self.events.lock().unwrap().push(events);
        *self.ice_servers.lock().unwrap() = ice_servers.to_vec();
        Ok(negotiator)
    }
}

pub struct FakeTrack {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
}

impl FakeTrack {
    pub fn new(stream_id: &str, track_id: &str, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            track_id: track_id.to_string(),
            kind,
        })
    }
}

impl RemoteTrack for FakeTrack {
    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn track_id(&self) -> String {
        self.track_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct RecordingTarget {
    bound: Mutex<Vec<String>>,
    attached: Mutex<Vec<String>>,
}

impl RecordingTarget {
    pub fn bound(&self) -> Vec<String> {
        self.bound.lock().unwrap().clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl RenderTarget for RecordingTarget {
    async fn bind_stream(&self, stream_id: &str) -> Result<()> {
        self.bound.lock().unwrap().push(stream_id.to_string());
        Ok(())
    }

    async fn attach_track(&self, track: Arc<dyn RemoteTrack>) -> Result<()> {
        self.attached.lock().unwrap().push(track.track_id());
        Ok(())
    }
}

pub struct Harness {
    pub client: SignalingClient,
    pub connector: MemoryConnector,
    pub relays: mpsc::UnboundedReceiver<RelayEnd>,
    pub factory: Arc<FakeFactory>,
    pub target: Arc<RecordingTarget>,
}

impl Harness {
    pub fn new(factory: FakeFactory) -> Self {
        init_tracing();
        let (connector, relays) = MemoryConnector::new();
        let factory = Arc::new(factory);
        let target = Arc::new(RecordingTarget::default());
        let client = SignalingClient::new(
            Arc::new(connector.clone()),
            factory.clone(),
            target.clone(),
            vec![IceServer::stun(core_types::DEFAULT_STUN_SERVER)],
        );
        Self {
            client,
            connector,
            relays,
            factory,
            target,
        }
    }

    pub async fn next_relay(&mut self) -> RelayEnd {
        timeout(Duration::from_secs(2), self.relays.recv())
            .await
            .expect("timed out waiting for a channel")
            .expect("connector dropped")
    }
}

pub async fn next_message(relay: &mut RelayEnd) -> signaling::SignalingMessage {
    timeout(Duration::from_secs(2), relay.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("channel closed")
}

/// 条件が満たされるまで待つ
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
