use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::provider::Cancelled;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),

    #[error("job was cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(anyhow::Error),
}

/// Runs blocking jobs off the async executor, at most `max_concurrency` at a time.
///
/// Each job receives a [`CancellationToken`] that fires when the caller stops
/// waiting: either the configured timeout elapsed or the awaiting future was
/// dropped (for example because the HTTP client went away).
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize, timeout: Option<Duration>) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            timeout,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.permits.available_permits()
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce(&CancellationToken) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = CancellationToken::new();
        // Cancels the job if this future is dropped or returns early.
        let _guard = cancel.clone().drop_guard();

        let work = {
            let permits = self.permits.clone();
            let cancel = cancel.clone();
            async move {
                let permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| PoolError::Failed(e.into()))?;
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    if cancel.is_cancelled() {
                        return Err(Cancelled.into());
                    }
                    job(&cancel)
                });
                match handle.await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) if e.is::<Cancelled>() => Err(PoolError::Cancelled),
                    Ok(Err(e)) => Err(PoolError::Failed(e)),
                    Err(join) => Err(PoolError::Failed(anyhow::anyhow!(
                        "generation worker failed: {join}"
                    ))),
                }
            }
        };

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(PoolError::TimedOut(limit))
                }
            },
            None => work.await,
        }
    }
}
