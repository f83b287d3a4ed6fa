use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use chatbridge_app::{Orchestrator, OrchestratorSettings, SessionManager};
use chatbridge_executors::{ClaudeExecutor, CodexExecutor, Executor, Runner};
use chatbridge_protocol::{Platform, SessionStore, Transport};
use chatbridge_security::Policy;
use chatbridge_store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = chatbridge_config::load_from_env()?;
    tracing::info!(sqlite_path = %config.storage.sqlite_path, "chatbridge starting");

    let store = Arc::new(SqliteStore::open(&config.storage.sqlite_path)?);
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        config.session_retention(),
    ));
    let policy = Arc::new(Policy::new(
        &config.security.allowlist_commands,
        &[config.security.project_root.clone()],
    ));

    let session_store: Arc<dyn SessionStore> = store.clone();
    let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
    executors.insert(
        "codex".to_owned(),
        Arc::new(CodexExecutor::new(
            &config.executor.codex_binary,
            Arc::clone(&session_store),
        )),
    );
    executors.insert(
        "claude".to_owned(),
        Arc::new(ClaudeExecutor::new(
            &config.executor.claude_binary,
            Arc::clone(&session_store),
        )),
    );

    // Transport implementations register here; none ship in-tree.
    let transports: HashMap<Platform, Arc<dyn Transport>> = HashMap::new();
    if config.telegram.enabled && !transports.contains_key(&Platform::Telegram) {
        tracing::warn!("telegram is enabled but no telegram transport is linked");
    }
    if config.whatsapp.enabled && !transports.contains_key(&Platform::WhatsApp) {
        tracing::warn!("whatsapp is enabled but no whatsapp transport is linked");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        sessions,
        policy,
        Runner::new(config.executor_timeout()),
        executors,
        transports.clone(),
        OrchestratorSettings {
            max_concurrent_sessions: config.queue.max_concurrent_sessions,
            per_session_buffer: config.queue.per_session_buffer,
            batch_interval: config.batch_interval(),
            max_chunk_bytes: config.stream.max_chunk_bytes,
        },
    ));

    let shutdown = CancellationToken::new();
    for transport in transports.values() {
        let transport = Arc::clone(transport);
        let handler = Arc::clone(&orchestrator);
        let token = shutdown.child_token();
        tokio::spawn(async move {
            tracing::info!(transport = transport.name(), "transport starting");
            if let Err(err) = transport.start(token.clone(), handler).await {
                if !token.is_cancelled() {
                    tracing::error!(
                        transport = transport.name(),
                        error = %err,
                        "transport stopped with error"
                    );
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    orchestrator.shutdown();
    tracing::info!("chatbridge stopped");
    Ok(())
}
