//! Quantum Storytelling server entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use quantum_storytelling::config::{Config, Provider};
use quantum_storytelling::db::Database;
use quantum_storytelling::gateway::LanguageModel;
use quantum_storytelling::gemini::GeminiClient;
use quantum_storytelling::openai::OpenAIClient;
use quantum_storytelling::{logging, router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    logging::init_logging(config.log_dir.as_deref()).context("Failed to initialize logging")?;
    match logging::cleanup_old_logs() {
        Ok(0) => {}
        Ok(n) => info!("Removed {} old log files", n),
        Err(e) => warn!("Failed to clean up old logs: {}", e),
    }

    let api_key = config.resolve_api_key()?;
    let model: Arc<dyn LanguageModel> = match config.provider {
        Provider::Gemini => Arc::new(
            GeminiClient::new(&api_key)?
                .with_model(config.model.clone())
                .with_embedding_model(config.embedding_model.clone())
                .with_api_base(config.api_base.clone()),
        ),
        Provider::Openai => Arc::new(
            OpenAIClient::new(&api_key)?
                .with_model(config.model.clone())
                .with_embedding_model(config.embedding_model.clone())
                .with_api_base(config.api_base.clone()),
        ),
    };
    info!("Using {} provider", config.provider.as_str());

    let db = Database::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    info!("Database ready at {}", config.database.display());

    let app = router(AppState::new(db, model, config.embedding_min_chars));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;
    info!("Listening on {}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
