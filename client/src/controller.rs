use anyhow::Result;
use core_types::{validate_room, ClientError, IceServer};
use signaling::{Session, SignalingClient};
use std::str::FromStr;
use tracing::{info, warn};

/// 対話入力のコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Avatar,
    Leave,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest),
            None => (line, ""),
        };
        match name.to_ascii_lowercase().as_str() {
            // ルーム名の検証は join 側で行う
            "join" => Ok(Command::Join(rest.to_string())),
            "avatar" | "start-avatar" => Ok(Command::Avatar),
            "leave" => Ok(Command::Leave),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

pub const HELP: &str = "commands: join <room> | avatar | leave | quit";

/// URIごとに IceServer を作り、TURN には認証情報を付ける
pub fn build_ice_servers(urls: &[String], username: &str, credential: &str) -> Vec<IceServer> {
    urls.iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .map(|url| {
            let mut server = IceServer::stun(url);
            if url.starts_with("turn:") || url.starts_with("turns:") {
                server.username = username.to_string();
                server.credential = credential.to_string();
            }
            server
        })
        .collect()
}

/// 画面側の操作に相当する。セッションは常に高々1つ
pub struct Controller {
    client: SignalingClient,
    session: Option<Session>,
}

impl Controller {
    pub fn new(client: SignalingClient) -> Self {
        Self {
            client,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// 既存のセッションを閉じてから新しいルームに参加する
    pub async fn join(&mut self, room: &str) -> Result<()> {
        // 入力が不正なら今のセッションには触れない
        validate_room(room)?;

        self.leave().await;
        self.session = Some(self.client.join(room).await?);
        Ok(())
    }

    pub fn request_avatar(&self) -> Result<(), ClientError> {
        match &self.session {
            Some(session) => session.request_avatar(),
            None => Err(ClientError::NotReady),
        }
    }

    pub async fn leave(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Leaving room: {}", session.room());
            if let Err(e) = session.close().await {
                warn!("Previous session ended with error: {:#}", e);
            }
        }
    }
}
