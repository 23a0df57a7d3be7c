//! RAG backend server
//!
//! Loads settings from the environment, reconciles LLM providers and
//! models, and serves the REST API. Exits non-zero on unrecoverable
//! misconfiguration.

use ragmill::api::{AppState, serve};
use ragmill::config::Settings;
use ragmill::init::SystemInitializer;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    settings.validate()?;
    info!(
        "Starting ragmill {} with {} vector store",
        ragmill::VERSION,
        settings.vector_store.kind
    );

    let state = AppState::new(settings.clone()).await?;

    let initializer = SystemInitializer::new(state.pool.clone(), Arc::new(settings));
    let providers = initializer.run().await?;
    if providers.is_empty() {
        anyhow::bail!("no LLM provider is configured; set WATSONX_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY");
    }

    serve(state).await?;
    Ok(())
}
