//! Owned handle on a long-running follower subprocess (`tail -f`).
//!
//! The child is owned by a supervisor task. The handle exposes three
//! channels: stdout chunks, stderr chunks, and termination. Cancelling, or
//! dropping the handle, terminates the child: SIGTERM, a short grace
//! period, then SIGKILL.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};

/// Time a follower gets to exit on SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub origin: Origin,
    pub text: String,
}

pub struct FollowProcess {
    pid: Option<u32>,
    chunks: mpsc::Receiver<Chunk>,
    cancel: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl FollowProcess {
    /// Spawn `program args...` with piped output. No shell is involved.
    pub fn spawn<I, S>(program: &str, args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward(stdout, Origin::Stdout, chunk_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward(stderr, Origin::Stderr, chunk_tx)));
        }

        tokio::spawn(supervise(child, pid, readers, cancel_rx, exited_tx));

        tracing::debug!(pid = ?pid, program, "Spawned follower");

        Ok(Self {
            pid,
            chunks: chunk_rx,
            cancel: Some(cancel_tx),
            exited: exited_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output chunk, or `None` once both streams are closed.
    /// Chunks of one origin arrive in the order the child wrote them.
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.chunks.recv().await
    }

    /// Ask the supervisor to terminate the child. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolve once the child has exited and been reaped.
    pub async fn terminated(&mut self) {
        // Err means the supervisor is gone, which only happens after it has reaped the child.
        let _ = self.exited.wait_for(|done| *done).await;
    }
}

impl Drop for FollowProcess {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn forward<R>(mut reader: R, origin: Origin, tx: mpsc::Sender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Chunk {
                    origin,
                    text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, ?origin, "Follower stream read failed");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    cancel: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
) {
    tokio::select! {
        status = child.wait() => {
            tracing::debug!(pid = ?pid, status = ?status, "Follower exited");
            // Drain what the child wrote before it exited.
            for reader in readers {
                let _ = reader.await;
            }
        }
        // Fires on explicit cancel and when the handle is dropped.
        _ = cancel => {
            terminate(&mut child, pid).await;
            for reader in readers {
                reader.abort();
            }
        }
    }
    let _ = exited.send(true);
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            tracing::debug!(pid = raw, error = %e, "SIGTERM to follower failed");
        }
        if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
            tracing::debug!(pid = raw, status = ?status, "Follower terminated");
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(pid = ?pid, error = %e, "Failed to kill follower");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(pid = ?pid, status = %status, "Follower killed"),
        Err(e) => tracing::warn!(pid = ?pid, error = %e, "Failed to reap follower"),
    }
}

#[cfg(test)]
pub(crate) fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
