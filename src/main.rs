use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;

use overwatch_core::CompletionBackend;
use overwatch_engine::{EngineConfig, GeneratorConfig, InstructionGenerator, PolicyEngine, SuggestionAdvisor};
use overwatch_llm::{AnthropicBackend, ReliableBackend, UnavailableBackend};
use overwatch_server::handlers::HandlerState;
use overwatch_server::{Gateway, HubRegistry, LifecycleManager, ServerConfig};
use overwatch_settings::{resolve_path, OverwatchSettings};
use overwatch_store::{Database, PolicyRepo, PolicyRow, Stores};
use overwatch_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "overwatch", about = "Policy enforcement for coding-agent sessions")]
struct Args {
    /// Settings file (defaults to ~/.overwatch/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => overwatch_settings::load_settings_from_path(path),
        None => overwatch_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    let telemetry = Arc::new(init_telemetry(telemetry_config(&settings)));
    tracing::info!("starting overwatch");

    let db_path = resolve_path(&settings.storage.database_path);
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let db = Database::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    if let Some(raw) = settings.policies_path.as_deref() {
        let count = seed_policies(&db, &resolve_path(raw))?;
        tracing::info!(count, "policies loaded");
    }

    let stores = Stores::sqlite(&db);
    let generator = Arc::new(InstructionGenerator::new(
        backend(&settings),
        GeneratorConfig {
            timeout: Duration::from_millis(settings.generator.timeout_ms),
            max_tokens: settings.generator.max_tokens,
            max_output_chars: settings.generator.max_output_chars,
        },
    ));
    let engine = Arc::new(PolicyEngine::new(
        stores.policies.clone(),
        stores.interventions.clone(),
        generator.clone(),
        EngineConfig {
            policy_fetch_timeout: Duration::from_millis(settings.engine.policy_fetch_timeout_ms),
            policy_fetch_attempts: settings.engine.policy_fetch_attempts,
            ..Default::default()
        },
    ));
    let advisor = Arc::new(SuggestionAdvisor::new(
        stores.events.clone(),
        stores.policies.clone(),
        generator,
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        stores.sessions.clone(),
        Duration::from_secs(settings.lifecycle.staleness_secs),
    ));
    let gateway = Arc::new(Gateway::new(
        stores,
        engine,
        advisor,
        Arc::new(HubRegistry::new()),
        lifecycle,
    ));
    let handler_state = Arc::new(HandlerState::new(db, gateway).with_telemetry(telemetry));

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
        ping_interval: Duration::from_secs(settings.server.ping_interval_secs),
        sweep_interval: Duration::from_secs(settings.lifecycle.sweep_interval_secs),
    };
    let handle = overwatch_server::start(config, handler_state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "overwatch ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn telemetry_config(settings: &OverwatchSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: settings.logging.level.parse().unwrap_or(tracing::Level::INFO),
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: resolve_path(&settings.logging.log_database_path),
        ..Default::default()
    }
}

/// Anthropic behind retries when a key is present, otherwise a backend that
/// always fails so every instruction is the policy's own fallback text.
fn backend(settings: &OverwatchSettings) -> Arc<dyn CompletionBackend> {
    let key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.trim().is_empty());
    let Some(key) = key else {
        tracing::warn!("ANTHROPIC_API_KEY not set, using fallback instructions only");
        return Arc::new(UnavailableBackend::new("no API key configured"));
    };

    match AnthropicBackend::new(
        SecretString::from(key),
        settings.generator.model.clone(),
        &settings.generator.api_base_url,
    ) {
        Ok(inner) => Arc::new(ReliableBackend::with_defaults(inner)),
        Err(e) => {
            tracing::warn!(error = %e, "completion backend unavailable, using fallback instructions only");
            Arc::new(UnavailableBackend::new(e.to_string()))
        }
    }
}

/// Upsert every policy in a JSON array file.
fn seed_policies(db: &Database, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let policies: Vec<PolicyRow> =
        serde_json::from_str(&raw).with_context(|| format!("invalid policy file {}", path.display()))?;
    let repo = PolicyRepo::new(db.clone());
    for policy in &policies {
        repo.upsert(policy)
            .with_context(|| format!("failed to store policy {}", policy.id))?;
    }
    Ok(policies.len())
}
