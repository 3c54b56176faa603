mod common;

use anyhow::{bail, Result};
use common::{init_tracing, Call, FakeFactory, RecordingTarget};
use core_types::{IceServer, DEFAULT_STUN_SERVER};
use futures::{SinkExt, StreamExt};
use signaling::{signaling_endpoint, SignalingClient, SignalingMessage, WebSocketConnector};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerStream = WebSocketStream<TcpStream>;

fn client_for(addr: std::net::SocketAddr, factory: Arc<FakeFactory>) -> Result<SignalingClient> {
    init_tracing();
    let endpoint = signaling_endpoint(&format!("ws://{}", addr))?;
    Ok(SignalingClient::new(
        Arc::new(WebSocketConnector::new(endpoint)),
        factory,
        Arc::new(RecordingTarget::default()),
        vec![IceServer::stun(DEFAULT_STUN_SERVER)],
    ))
}

async fn accept(listener: &TcpListener) -> Result<ServerStream> {
    let (stream, _) = timeout(Duration::from_secs(2), listener.accept()).await??;
    Ok(tokio_tungstenite::accept_async(stream).await?)
}

/// サーバー側で次のテキストフレームを読む
async fn next_frame(ws: &mut ServerStream) -> Result<SignalingMessage> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await? {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => bail!("Unexpected frame: {:?}", other),
        }
    }
}

async fn send_frame(ws: &mut ServerStream, message: &SignalingMessage) -> Result<()> {
    ws.send(Message::Text(serde_json::to_string(message)?)).await?;
    Ok(())
}

#[tokio::test]
async fn test_session_over_websocket() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let factory = Arc::new(FakeFactory::default());
    let client = client_for(listener.local_addr()?, factory.clone())?;

    let session = client.join("lobby").await?;
    let mut ws = accept(&listener).await?;

    assert_eq!(
        next_frame(&mut ws).await?,
        SignalingMessage::Join {
            room: "lobby".to_string()
        }
    );
    assert!(timeout(Duration::from_secs(2), session.wait_open()).await?);

    send_frame(&mut ws, &SignalingMessage::Ready).await?;
    assert!(matches!(
        next_frame(&mut ws).await?,
        SignalingMessage::Offer { .. }
    ));

    session.request_avatar()?;
    assert_eq!(next_frame(&mut ws).await?, SignalingMessage::StartAvatar);

    // サーバーが閉じたらセッションも終わる
    ws.close(None).await?;
    timeout(Duration::from_secs(2), session.wait()).await??;
    assert_eq!(factory.negotiator().calls().last(), Some(&Call::Close));
    Ok(())
}

#[tokio::test]
async fn test_leaving_sends_close_frame() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let factory = Arc::new(FakeFactory::default());
    let client = client_for(listener.local_addr()?, factory.clone())?;

    let session = client.join("lobby").await?;
    let mut ws = accept(&listener).await?;
    next_frame(&mut ws).await?;

    session.close().await?;

    let frame = timeout(Duration::from_secs(2), ws.next()).await?;
    assert!(matches!(frame, Some(Ok(Message::Close(_)))));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_relay_ends_session() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let factory = Arc::new(FakeFactory::default());
    let client = client_for(addr, factory.clone())?;

    let session = client.join("lobby").await?;
    assert!(!timeout(Duration::from_secs(2), session.wait_open()).await?);
    assert!(!session.is_open());

    timeout(Duration::from_secs(2), session.wait()).await??;
    assert_eq!(factory.negotiator().calls(), vec![Call::Close]);
    Ok(())
}
