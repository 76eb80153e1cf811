//! Live log tailing sessions.
//!
//! One [`TailSession`] per client connection, moving through
//! `Connecting -> Authenticated -> Streaming -> Closed`. The first inbound
//! message must be a `{token, key}` handshake; after that the session only
//! forwards follower output until either side goes away. Whatever the exit
//! path, the follower is terminated before [`TailSession::run`] returns.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ControlError;
use crate::native::process::{Chunk, FollowProcess, Origin};
use crate::registry::{ServerRegistry, LOG_FILE_NAME};
use crate::security::auth::AuthGate;
use crate::security::path_guard::safe_join;

/// Upper bound on waiting for a cancelled follower to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Streaming,
    Closed,
}

/// A message from the client, already stripped of transport framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Data,
    Err,
}

/// A message to the client. Serialises to `{"type","chunk"}` or `{"error"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Chunk {
        #[serde(rename = "type")]
        kind: ChunkKind,
        chunk: String,
    },
    Error {
        error: String,
    },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error {
            error: message.into(),
        }
    }
}

impl From<Chunk> for Outbound {
    fn from(chunk: Chunk) -> Self {
        let kind = match chunk.origin {
            Origin::Stdout => ChunkKind::Data,
            Origin::Stderr => ChunkKind::Err,
        };
        Outbound::Chunk {
            kind,
            chunk: chunk.text,
        }
    }
}

#[derive(Deserialize)]
struct Handshake {
    token: Option<String>,
    key: Option<String>,
}

/// Starts the follower for a resolved log file.
pub trait FollowSpawner: Send + Sync {
    fn spawn(&self, log_file: &Path) -> std::io::Result<FollowProcess>;
}

/// `tail -n <backlog> -f <log_file>`.
pub struct TailSpawner {
    backlog: usize,
}

impl TailSpawner {
    pub fn new(backlog: usize) -> Self {
        Self { backlog }
    }
}

impl FollowSpawner for TailSpawner {
    fn spawn(&self, log_file: &Path) -> std::io::Result<FollowProcess> {
        let backlog = self.backlog.to_string();
        let args: [&OsStr; 4] = [
            "-n".as_ref(),
            backlog.as_ref(),
            "-f".as_ref(),
            log_file.as_os_str(),
        ];
        FollowProcess::spawn("tail", args)
    }
}

/// Everything a session needs, shared by all connections.
#[derive(Clone)]
pub struct StreamContext {
    pub gate: AuthGate,
    pub registry: Arc<dyn ServerRegistry>,
    pub spawner: Arc<dyn FollowSpawner>,
    pub handshake_timeout: Duration,
}

enum SessionEnd {
    /// Client went away; nothing to report.
    Disconnected,
    /// Report this to the client, then close.
    Failed(String),
}

pub struct TailSession {
    ctx: StreamContext,
    state: SessionState,
    follower: Option<FollowProcess>,
    outbound: mpsc::Sender<Outbound>,
}

impl TailSession {
    pub fn new(ctx: StreamContext, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            ctx,
            state: SessionState::Connecting,
            follower: None,
            outbound,
        }
    }

    /// Drive the session to completion and return its final state.
    pub async fn run<S>(mut self, mut inbound: S) -> SessionState
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        if let SessionEnd::Failed(message) = self.drive(&mut inbound).await {
            tracing::debug!(state = ?self.state, error = %message, "Closing tail session");
            let _ = self.outbound.send(Outbound::error(message)).await;
        }
        self.close().await;
        self.state
    }

    async fn drive<S>(&mut self, inbound: &mut S) -> SessionEnd
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let (key, log_file) = match self.handshake(inbound).await {
            Ok(resolved) => resolved,
            Err(end) => return end,
        };
        self.state = SessionState::Authenticated;

        match self.ctx.spawner.spawn(&log_file) {
            Ok(follower) => {
                tracing::info!(key = %key, pid = ?follower.pid(), "Tail session streaming");
                self.follower = Some(follower);
                self.state = SessionState::Streaming;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to start log follower");
                return SessionEnd::Failed("follow failed".to_string());
            }
        }

        self.stream(inbound).await
    }

    async fn handshake<S>(&mut self, inbound: &mut S) -> Result<(String, PathBuf), SessionEnd>
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let text = match tokio::time::timeout(self.ctx.handshake_timeout, inbound.next()).await {
            Err(_) => return Err(SessionEnd::Failed("handshake timeout".to_string())),
            Ok(None) | Ok(Some(Inbound::Close)) => return Err(SessionEnd::Disconnected),
            Ok(Some(Inbound::Text(text))) => text,
        };

        let handshake: Handshake = serde_json::from_str(&text)
            .map_err(|_| SessionEnd::Failed("bad request".to_string()))?;

        if let Err(e) = self.ctx.gate.check(handshake.token.as_deref()) {
            tracing::warn!("Rejected tail session without a valid admin token");
            return Err(SessionEnd::Failed(session_error(&e)));
        }

        let key = handshake.key.unwrap_or_default();
        let record = self
            .ctx
            .registry
            .resolve(&key)
            .await
            .map_err(|e| SessionEnd::Failed(session_error(&e)))?;
        let log_file = safe_join(&record.root_path, LOG_FILE_NAME).map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Cannot follow server log");
            SessionEnd::Failed(session_error(&e))
        })?;

        Ok((key, log_file))
    }

    async fn stream<S>(&mut self, inbound: &mut S) -> SessionEnd
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let Some(follower) = self.follower.as_mut() else {
            return SessionEnd::Disconnected;
        };

        loop {
            tokio::select! {
                msg = inbound.next() => match msg {
                    None | Some(Inbound::Close) => return SessionEnd::Disconnected,
                    // One follower per session; a second handshake is not allowed.
                    Some(Inbound::Text(_)) => return SessionEnd::Failed("bad request".to_string()),
                },
                chunk = follower.next_chunk() => match chunk {
                    Some(chunk) => {
                        if self.outbound.send(Outbound::from(chunk)).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    None => return SessionEnd::Failed("follower exited".to_string()),
                },
            }
        }
    }

    /// Enter `Closed`, terminating the follower if there is one.
    async fn close(&mut self) {
        if let Some(mut follower) = self.follower.take() {
            if follower.is_terminated() {
                tracing::debug!(pid = ?follower.pid(), "Log follower already exited");
            }
            follower.cancel();
            if tokio::time::timeout(REAP_TIMEOUT, follower.terminated()).await.is_err() {
                tracing::warn!(pid = ?follower.pid(), "Log follower did not exit in time");
            }
        }
        self.state = SessionState::Closed;
    }
}

/// Client-facing wording for handshake failures.
fn session_error(err: &ControlError) -> String {
    match err {
        ControlError::Unauthorized => "unauthorized",
        ControlError::NotFound(_) => "unknown key",
        ControlError::InvalidPath(_) => "invalid path",
        ControlError::RootMissing(_) => "could not read log",
        _ => "bad request",
    }
    .to_string()
}
