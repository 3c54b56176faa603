use anyhow::{bail, Context, Result};
use url::Url;

/// リレーのシグナリングパス
pub const SIGNALING_PATH: &str = "/ws";

/// ベースURLからシグナリング用の WebSocket URL を決める
///
/// `http`/`https` は `ws`/`wss` に置き換え、パスが無ければ `/ws` を付ける。
pub fn signaling_endpoint(base: &str) -> Result<Url> {
    let mut url = Url::parse(base.trim()).context("Failed to parse signaling url")?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => bail!("Unsupported signaling url scheme: {}", other),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        bail!("Failed to switch signaling url scheme to {}", scheme);
    }

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(SIGNALING_PATH);
    }

    Ok(url)
}
