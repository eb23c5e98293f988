use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::analyzer::SummaryAnalyzer;
use super::api::{self, AppState};
use super::context::JobsContext;
use super::dispatcher::BatchDispatcher;
use super::executor::{CandidateSource, CollaboratorExecutor};
use super::github::GitHubClient;
use super::worker::WorkerPool;
use crate::config::RepowatchConfig;

/// Configuration for the admin server.
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
    /// Run workers in the same process as the HTTP server.
    pub workers: bool,
    pub settings: RepowatchConfig,
}

impl ServerConfig {
    pub fn new(settings: RepowatchConfig) -> Self {
        Self {
            port: settings.toml.server.port,
            dev_mode: false,
            workers: true,
            settings,
        }
    }
}

/// Wire the shared context into application state.
pub fn app_state(ctx: JobsContext, candidates: Option<Arc<dyn CandidateSource>>) -> Arc<AppState> {
    let dispatcher = BatchDispatcher::new(Arc::new(ctx.registry.clone()), ctx.status.clone());
    Arc::new(AppState {
        ctx,
        dispatcher,
        candidates,
    })
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the admin server and, unless disabled, the worker pool. Returns
/// after Ctrl+C once in-flight jobs have finished.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let settings = &config.settings.toml;
    let ctx = config.settings.open_jobs()?;

    let github = Arc::new(
        GitHubClient::new(&settings.github.api_url, &settings.github.token_env)
            .context("Failed to build GitHub client")?,
    );
    let executor = Arc::new(CollaboratorExecutor::new(
        github.clone(),
        Arc::new(SummaryAnalyzer),
        ctx.results.clone(),
    ));

    let pool = config.workers.then(|| {
        WorkerPool::start(
            &ctx,
            executor,
            |op| settings.concurrency(op),
            settings.worker_settings(),
        )
    });

    let candidates: Arc<dyn CandidateSource> = github;
    let app = build_router(app_state(ctx, Some(candidates)), config.dev_mode);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "admin server listening");
    println!("repowatch running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    served?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
