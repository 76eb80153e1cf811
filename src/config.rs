// TOML config parsing for opsdeck.toml.
//
// Every key has a default so a missing file is not an error. Environment
// variables (ADMIN_TOKEN, PORT, OPSDECK_BIND, SERVERS_FILE, OPENAI_API_KEY)
// override whatever the file says.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config location (relative to CWD).
const DEFAULT_CONFIG_PATH: &str = "opsdeck.toml";

/// Token used when none is configured. Startup warns loudly when this is in effect.
pub const DEFAULT_ADMIN_TOKEN: &str = "changeme_very_secure_token";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub scripts: ScriptConfig,
    pub logs: LogConfig,
    pub stream: StreamConfig,
    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: DEFAULT_ADMIN_TOKEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("servers.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub timeout_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

impl ScriptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub default_lines: usize,
    pub max_lines: usize,
    /// Lines of history `tail -f` replays before following.
    pub follow_backlog: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_lines: 200,
            max_lines: 5000,
            follow_backlog: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub handshake_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_tokens: 600,
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config TOML: {}", e))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            self.auth.token = token;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT {:?}: {}", port, e))?;
        }
        if let Some(bind) = lookup("OPSDECK_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = lookup("SERVERS_FILE") {
            self.registry.path = PathBuf::from(path);
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            self.assistant.api_key = Some(key);
        }
        Ok(())
    }

    pub fn uses_default_token(&self) -> bool {
        self.auth.token == DEFAULT_ADMIN_TOKEN
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

/// Load opsdeck.toml (or `$OPSDECK_CONFIG`), then layer the environment on top.
pub fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("OPSDECK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = if Path::new(&path).exists() {
        tracing::info!("Loading config from {}", path);
        Config::load_from_file(&path)?
    } else {
        tracing::info!("No config file at {}; using defaults", path);
        Config::default()
    };

    config.apply_env(|name| std::env::var(name).ok())?;
    Ok(config)
}
