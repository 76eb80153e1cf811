pub mod config;
pub mod engine;
pub mod error;
pub mod native;
pub mod providers;
pub mod registry;
pub mod security;
pub mod upstream;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::engine::server::{build_router, AppState};
use crate::engine::stream::{StreamContext, TailSpawner};
use crate::providers::servers::ControlPlane;
use crate::registry::{FileRegistry, ServerRegistry};
use crate::security::auth::AuthGate;
use crate::upstream::assistant::{CompletionService, OpenAiCompletion};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("opsdeck=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting opsdeck control plane");

    let config = config::load_config()?;
    let bind_addr = config.bind_addr();

    if config.uses_default_token() {
        tracing::warn!("ADMIN_TOKEN is not set; using the built-in default token. Set it before exposing this service.");
    }

    let file_registry = FileRegistry::new(&config.registry.path);
    let registry_path = file_registry.path().display().to_string();
    let registry: Arc<dyn ServerRegistry> = Arc::new(file_registry);
    match registry.snapshot().await {
        Ok(servers) => {
            tracing::info!(path = %registry_path, count = servers.len(), "Server registry loaded")
        }
        // Re-read on every request, so a broken file at startup is not fatal.
        Err(e) => tracing::warn!(error = %e, "Server registry is not readable yet"),
    }

    let assistant: Option<Arc<dyn CompletionService>> =
        match OpenAiCompletion::from_config(&config.assistant).context("Failed to build completion client")? {
            Some(client) => {
                tracing::info!(model = %config.assistant.model, "Assistant enabled");
                Some(Arc::new(client))
            }
            None => {
                tracing::info!("No OPENAI_API_KEY configured; assistant disabled");
                None
            }
        };

    let gate = AuthGate::new(config.auth.token.clone());
    let plane = ControlPlane::new(registry.clone(), &config.scripts, &config.logs);
    let state = AppState {
        plane: Arc::new(plane),
        assistant,
        stream: StreamContext {
            gate,
            registry,
            spawner: Arc::new(TailSpawner::new(config.logs.follow_backlog)),
            handshake_timeout: config.stream.handshake_timeout(),
        },
    };

    let app = build_router(state);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tracing::info!("opsdeck listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
