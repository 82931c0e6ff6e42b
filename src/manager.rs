use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{ModelSource, ServeConfig};
use crate::hub;
use crate::loader::{self, ModelSlot};
use crate::pool::WorkerPool;
use crate::provider::ModelProvider;
use crate::qwen2::Qwen2Provider;
use crate::server::{create_router, AppState};

/// Owns the model slot and worker pool for one served model.
#[derive(Debug, Clone)]
pub struct ModelManager {
    config: ServeConfig,
    slot: Arc<ModelSlot>,
    pool: Arc<WorkerPool>,
}

impl ModelManager {
    pub fn new(config: ServeConfig) -> Self {
        let pool = WorkerPool::new(config.max_concurrency, config.generation_timeout);
        Self {
            config,
            slot: Arc::new(ModelSlot::new()),
            pool: Arc::new(pool),
        }
    }

    pub fn slot(&self) -> Arc<ModelSlot> {
        self.slot.clone()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            slot: self.slot.clone(),
            pool: self.pool.clone(),
            model_name: self.config.model.display_name().into(),
            default_system_prompt: self.config.system_prompt.as_str().into(),
        }
    }

    /// Starts loading the model in the background. The returned task finishes once
    /// the model is ready or the load policy gives up.
    pub fn spawn_loader(&self) -> tokio::task::JoinHandle<()> {
        let source = self.config.model.clone();
        tokio::spawn(loader::supervise(
            self.slot.clone(),
            self.config.load_policy,
            move || {
                let source = source.clone();
                async move {
                    let provider = Qwen2Provider::load(&source).await?;
                    Ok::<_, anyhow::Error>(Arc::new(provider) as Arc<dyn ModelProvider>)
                }
            },
        ))
    }

    pub async fn serve(&self) -> Result<()> {
        let addr = self.config.addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;

        // The listener is up before the model loads so health checks answer immediately.
        let loader = self.spawn_loader();

        tracing::info!("Server listening on http://{}", addr);
        tracing::info!(
            model = %self.config.model.model_id,
            max_concurrency = self.pool.max_concurrency(),
            "Chat endpoint: http://{}/chat",
            addr
        );

        let app = create_router(self.app_state());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        loader.abort();
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Downloads every file of `source` into the local hub cache.
    pub async fn pull(source: &ModelSource) -> Result<()> {
        tracing::info!("Pulling model: {}", source.model_id);
        let files = hub::fetch(source).await?;
        for path in files.all() {
            println!("{}", path.display());
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
