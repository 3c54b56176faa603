use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use core_types::{MediaKind, RemoteTrack, RenderTarget};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc_rs::media::io::h264_writer::H264Writer;
use webrtc_rs::media::io::ivf_reader::IVFFileHeader;
use webrtc_rs::media::io::ivf_writer::IVFWriter;
use webrtc_rs::media::io::ogg_writer::OggWriter;
use webrtc_rs::media::io::Writer;
use webrtc_rs::rtp::packet::Packet;
use webrtc_rs::track::track_remote::TrackRemote;

use crate::connection::WebRtcTrack;

type BoxedWriter = Box<dyn Writer + Send + Sync>;

const WRITE_QUEUE: usize = 256;

/// IVF ヘッダに書く映像サイズ（`1280x720` 形式）
///
/// 0x0 は不明を表し、デコーダはビットストリーム側のサイズを使う。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u16,
    pub height: u16,
}

impl FromStr for FrameSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Expected WIDTHxHEIGHT, got {}", s))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid frame size {}: {}", s, e))
        };
        Ok(Self {
            width: parse(width)?,
            height: parse(height)?,
        })
    }
}

/// 書き出し先のコンテナ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Ivf([u8; 4]),
    H264,
    Ogg,
}

impl Container {
    fn for_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type.to_lowercase().as_str() {
            "video/vp8" => Some(Container::Ivf(*b"VP80")),
            "video/vp9" => Some(Container::Ivf(*b"VP90")),
            "video/h264" => Some(Container::H264),
            "audio/opus" => Some(Container::Ogg),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Container::Ivf(_) => "ivf",
            Container::H264 => "h264",
            Container::Ogg => "ogg",
        }
    }
}

/// 受信トラックの描画先
///
/// 出力先ディレクトリがあればコンテナファイルへ書き出し、無ければ読み捨てる。
/// ファイル操作はブロッキングスレッドで行う。
pub struct TrackRecorder {
    output_dir: Option<PathBuf>,
    frame_size: FrameSize,
    active_stream: Mutex<Option<String>>,
}

impl TrackRecorder {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self {
            output_dir,
            frame_size: FrameSize::default(),
            active_stream: Mutex::new(None),
        }
    }

    pub fn with_frame_size(mut self, frame_size: FrameSize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn active_stream(&self) -> Option<String> {
        self.active_stream
            .lock()
            .ok()
            .and_then(|stream| stream.clone())
    }

    async fn open_recording(
        &self,
        dir: &Path,
        track: &dyn RemoteTrack,
        remote: &TrackRemote,
    ) -> Result<Option<BoxedWriter>> {
        let mime_type = remote.codec().capability.mime_type;
        let Some(container) = Container::for_mime_type(&mime_type) else {
            warn!("No recorder for {}, packets will be discarded", mime_type);
            return Ok(None);
        };

        let stem = file_stem(&track.stream_id(), &track.track_id(), track.kind());
        let path = dir.join(format!("{}.{}", stem, container.extension()));
        let frame_size = self.frame_size;
        let writer = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || open_writer(&path, container, frame_size))
                .await
                .context("Writer setup task failed")??
        };

        info!("Recording {} to {}", mime_type, path.display());
        Ok(Some(writer))
    }
}

#[async_trait]
impl RenderTarget for TrackRecorder {
    async fn bind_stream(&self, stream_id: &str) -> Result<()> {
        info!("Rendering stream: {}", stream_id);
        if let Ok(mut active) = self.active_stream.lock() {
            *active = Some(stream_id.to_string());
        }
        if let Some(dir) = &self.output_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    async fn attach_track(&self, track: Arc<dyn RemoteTrack>) -> Result<()> {
        let Some(webrtc_track) = track.as_any().downcast_ref::<WebRtcTrack>() else {
            bail!("Unsupported track implementation: {}", track.track_id());
        };
        let remote = webrtc_track.inner().clone();

        let writer = match &self.output_dir {
            Some(dir) => self.open_recording(dir, track.as_ref(), &remote).await?,
            None => None,
        };

        let label = format!("{}/{}", track.stream_id(), track.track_id());
        tokio::spawn(drain_track(label, remote, writer));
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// ストリームIDとトラックIDをファイル名に使える形にする
pub fn file_stem(stream_id: &str, track_id: &str, kind: MediaKind) -> String {
    let kind = match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
        MediaKind::Unknown => "media",
    };
    format!("{}-{}-{}", sanitize(stream_id), sanitize(track_id), kind)
}

fn ivf_header(four_cc: [u8; 4], frame_size: FrameSize) -> IVFFileHeader {
    IVFFileHeader {
        signature: *b"DKIF",
        version: 0,
        header_size: 32,
        four_cc,
        width: frame_size.width,
        height: frame_size.height,
        timebase_denominator: 30,
        timebase_numerator: 1,
        // 受信前にはフレーム数が分からない
        num_frames: 0,
        unused: 0,
    }
}

fn open_writer(path: &Path, container: Container, frame_size: FrameSize) -> Result<BoxedWriter> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let writer: BoxedWriter = match container {
        Container::Ivf(four_cc) => Box::new(IVFWriter::new(file, &ivf_header(four_cc, frame_size))?),
        Container::H264 => Box::new(H264Writer::new(file)),
        Container::Ogg => Box::new(OggWriter::new(file, 48000, 2)?),
    };
    Ok(writer)
}

/// ブロッキングスレッド側の書き込みループ
fn write_packets(label: &str, mut writer: BoxedWriter, mut packet_rx: mpsc::Receiver<Packet>) {
    let mut written: u64 = 0;
    while let Some(packet) = packet_rx.blocking_recv() {
        if let Err(e) = writer.write_rtp(&packet) {
            warn!("Failed to write RTP packet for {}: {}", label, e);
            break;
        }
        written += 1;
    }
    if let Err(e) = writer.close() {
        warn!("Failed to close recording for {}: {}", label, e);
    }
    debug!("Recording for {} closed after {} packets", label, written);
}

async fn drain_track(label: String, track: Arc<TrackRemote>, writer: Option<BoxedWriter>) {
    let started = Instant::now();
    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;

    let (mut packet_tx, write_handle) = match writer {
        Some(writer) => {
            let (tx, rx) = mpsc::channel(WRITE_QUEUE);
            let label = label.clone();
            let handle = tokio::task::spawn_blocking(move || write_packets(&label, writer, rx));
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                packets += 1;
                bytes += packet.payload.len() as u64;
                let delivered = match &packet_tx {
                    Some(tx) => tx.send(packet).await.is_ok(),
                    None => true,
                };
                if !delivered {
                    // 書き込み側が止まったので以降は読み捨てる
                    packet_tx = None;
                }
                if packets % 500 == 0 {
                    debug!("Track {}: {} packets received", label, packets);
                }
            }
            Err(e) => {
                debug!("Track {} read loop finished: {}", label, e);
                break;
            }
        }
    }

    drop(packet_tx);
    if let Some(handle) = write_handle {
        if let Err(e) = handle.await {
            warn!("Recording task for {} failed: {}", label, e);
        }
    }
    info!(
        "Track {} ended: {} packets, {} bytes in {}s",
        label,
        packets,
        bytes,
        started.elapsed().as_secs()
    );
}
