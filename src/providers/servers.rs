use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{LogConfig, ScriptConfig};
use crate::error::{ControlError, Result};
use crate::native::log::{last_log_line, read_log_tail};
use crate::native::script::{run_script, Action};
use crate::registry::{ServerRecord, ServerRegistry, LOG_FILE_NAME};
use crate::security::path_guard::safe_join;

/// Caller-facing operations over the managed servers.
pub struct ControlPlane {
    registry: Arc<dyn ServerRegistry>,
    script_timeout: Duration,
    default_lines: usize,
    max_lines: usize,
}

impl ControlPlane {
    pub fn new(registry: Arc<dyn ServerRegistry>, scripts: &ScriptConfig, logs: &LogConfig) -> Self {
        Self {
            registry,
            script_timeout: scripts.timeout(),
            default_lines: logs.default_lines,
            max_lines: logs.max_lines,
        }
    }

    /// Every registered server as `{key: {path, port}}`, with `path` as the
    /// registry declares it.
    pub async fn list(&self) -> Result<Value> {
        let servers = self.registry.snapshot().await?;
        tracing::info!(count = servers.len(), "Listing servers");
        Ok(serde_json::json!(servers))
    }

    /// Last log line of a server. The port is not probed.
    pub async fn health(&self, key: &str) -> Result<Value> {
        let server = self.registry.resolve(key).await?;
        let last = last_log_line(&log_path(&server)?).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Health check could not read log");
            e
        })?;

        tracing::info!(key = %key, "Health check");
        Ok(serde_json::json!({ "ok": true, "lastLog": last }))
    }

    /// Run the lifecycle script behind `action`.
    ///
    /// The action is parsed before the registry is consulted, so an unknown
    /// action never causes a registry read or any process to be started.
    pub async fn invoke(&self, key: &str, action: &str) -> Result<Value> {
        let action: Action = action.parse()?;
        let server = self.registry.resolve(key).await?;

        tracing::info!(key = %key, action = %action, "Running lifecycle script");

        let timeout = self.script_timeout;
        let output = tokio::spawn(async move { run_script(&server, action, timeout).await })
            .await
            .map_err(|e| ControlError::Internal(format!("Script task failed: {}", e)))?
            .map_err(|e| {
                tracing::warn!(key = %key, action = %action, error = %e, "Lifecycle script failed");
                e
            })?;

        Ok(serde_json::json!({ "ok": true, "output": output }))
    }

    /// Last lines of a server's log. `lines` is the raw query value.
    pub async fn read_logs(&self, key: &str, lines: Option<&str>) -> Result<Value> {
        let server = self.registry.resolve(key).await?;
        let limit = self.line_limit(lines);
        let logs = read_log_tail(&log_path(&server)?, limit).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Failed to read log");
            e
        })?;

        tracing::info!(key = %key, lines = limit, "Read server log");
        Ok(serde_json::json!({ "ok": true, "logs": logs }))
    }

    /// Requested line count, falling back to the default when missing,
    /// non-numeric or zero, and capped at the configured maximum.
    pub fn line_limit(&self, requested: Option<&str>) -> usize {
        match requested.and_then(|s| s.trim().parse::<usize>().ok()) {
            Some(n) if n > 0 => n.min(self.max_lines),
            _ => self.default_lines,
        }
    }
}

fn log_path(server: &ServerRecord) -> Result<PathBuf> {
    safe_join(&server.root_path, LOG_FILE_NAME).map_err(|e| match e {
        ControlError::RootMissing(root) => {
            ControlError::LogUnavailable(format!("server root {} does not exist", root))
        }
        other => other,
    })
}
