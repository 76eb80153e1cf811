use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ControlError, Result};
use crate::registry::ServerRecord;
use crate::security::path_guard::safe_join;

/// Lifecycle actions a caller may request. Anything else is refused before
/// the registry or filesystem is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    ClearCache,
    ViewLogs,
    TailLogs,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Start,
        Action::Stop,
        Action::Restart,
        Action::ClearCache,
        Action::ViewLogs,
        Action::TailLogs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::ClearCache => "clear-cache",
            Action::ViewLogs => "view-logs",
            Action::TailLogs => "tail-logs",
        }
    }

    /// Script file, relative to the server root, that implements this action.
    pub fn script_name(self) -> &'static str {
        match self {
            Action::Start => "start.sh",
            Action::Stop => "stop.sh",
            Action::Restart => "restart.sh",
            Action::ClearCache => "clear-cache.sh",
            // tail-logs has no script of its own; live tailing goes through /ws/logs.
            Action::ViewLogs | Action::TailLogs => "view-logs.sh",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ControlError::UnknownAction(s.to_string()))
    }
}

/// Run the script behind `action` for `server`, returning its stdout.
///
/// The script runs as its own child process with CWD set to the server root.
/// Nothing from the request reaches a shell: the path comes from the closed
/// action table and the registry.
pub async fn run_script(server: &ServerRecord, action: Action, timeout: Duration) -> Result<String> {
    let script = safe_join(&server.root_path, action.script_name()).map_err(|e| match e {
        ControlError::RootMissing(root) => {
            tracing::warn!(key = %server.key, root = %root, "Server root does not exist");
            ControlError::ScriptMissing(action.script_name().to_string())
        }
        other => other,
    })?;

    match tokio::fs::metadata(&script).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(ControlError::ScriptMissing(action.script_name().to_string())),
    }

    let child = tokio::process::Command::new(&script)
        .current_dir(&server.root_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            ControlError::ExecutionFailure(format!("Failed to execute {}: {}", action.script_name(), e))
        })?;

    // On timeout the future is dropped, which drops the child and kills it.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            ControlError::ExecutionFailure(format!(
                "{} timed out after {}s",
                action.script_name(),
                timeout.as_secs()
            ))
        })?
        .map_err(|e| {
            ControlError::ExecutionFailure(format!("Failed to wait for {}: {}", action.script_name(), e))
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim_end();
        if stdout.is_empty() {
            Ok("OK".to_string())
        } else {
            Ok(stdout.to_string())
        }
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim_end();
        if stderr.is_empty() {
            Err(ControlError::ExecutionFailure(format!(
                "{} failed with status: {}",
                action.script_name(),
                output.status
            )))
        } else {
            Err(ControlError::ExecutionFailure(stderr.to_string()))
        }
    }
}
