use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::protocol::{HealthResponse, HealthStatus};
use crate::provider::ModelProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl LoadPolicy {
    /// One best-effort attempt, no retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`-th failure (1-based): doubles each time, capped at
    /// `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

pub enum LoadState {
    Initializing {
        attempt: u32,
        last_error: Option<String>,
    },
    Ready {
        provider: Arc<dyn ModelProvider>,
        attempts: u32,
    },
    Failed {
        attempts: u32,
        last_error: String,
    },
}

impl LoadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadState::Failed { .. })
    }
}

impl std::fmt::Debug for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Initializing { attempt, last_error } => f
                .debug_struct("Initializing")
                .field("attempt", attempt)
                .field("last_error", last_error)
                .finish(),
            LoadState::Ready { provider, attempts } => f
                .debug_struct("Ready")
                .field("model", &provider.model_id())
                .field("attempts", attempts)
                .finish(),
            LoadState::Failed { attempts, last_error } => f
                .debug_struct("Failed")
                .field("attempts", attempts)
                .field("last_error", last_error)
                .finish(),
        }
    }
}

/// Holds the model once it is loaded. Handlers read it; only the loader writes it.
#[derive(Debug)]
pub struct ModelSlot {
    state: watch::Sender<LoadState>,
}

impl Default for ModelSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSlot {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LoadState::Initializing {
            attempt: 0,
            last_error: None,
        });
        Self { state }
    }

    /// A slot that is ready from the start.
    pub fn ready(provider: Arc<dyn ModelProvider>) -> Self {
        let slot = Self::new();
        slot.set(LoadState::Ready {
            provider,
            attempts: 0,
        });
        slot
    }

    pub fn provider(&self) -> Option<Arc<dyn ModelProvider>> {
        match &*self.state.borrow() {
            LoadState::Ready { provider, .. } => Some(provider.clone()),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub fn health(&self) -> HealthResponse {
        match &*self.state.borrow() {
            LoadState::Initializing { attempt, last_error } => HealthResponse {
                status: HealthStatus::Initializing,
                attempts: *attempt,
                last_error: last_error.clone(),
            },
            LoadState::Ready { attempts, .. } => HealthResponse {
                status: HealthStatus::Ready,
                attempts: *attempts,
                last_error: None,
            },
            LoadState::Failed { attempts, last_error } => HealthResponse {
                status: HealthStatus::Initializing,
                attempts: *attempts,
                last_error: Some(last_error.clone()),
            },
        }
    }

    fn set(&self, state: LoadState) {
        // A ready model is never replaced.
        self.state.send_if_modified(|current| {
            if current.is_ready() {
                return false;
            }
            *current = state;
            true
        });
    }
}

/// Runs `load` until it succeeds or `policy.max_attempts` is spent, publishing
/// every transition into `slot`. Never panics or exits on failure.
pub async fn supervise<F, Fut>(slot: Arc<ModelSlot>, policy: LoadPolicy, mut load: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Arc<dyn ModelProvider>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        slot.set(LoadState::Initializing {
            attempt,
            last_error: last_error.clone(),
        });
        tracing::info!(attempt, max_attempts, "Loading model");

        match load().await {
            Ok(provider) => {
                tracing::info!(model = %provider.model_id(), attempt, "Model loaded successfully");
                slot.set(LoadState::Ready {
                    provider,
                    attempts: attempt,
                });
                return;
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::error!(attempt, max_attempts, error = %message, "Error loading model");
                last_error = Some(message);
            }
        }

        if attempt < max_attempts {
            let delay = policy.backoff(attempt);
            slot.set(LoadState::Initializing {
                attempt,
                last_error: last_error.clone(),
            });
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Retrying model load");
            tokio::time::sleep(delay).await;
        }
    }

    let last_error = last_error.unwrap_or_default();
    tracing::error!(
        attempts = max_attempts,
        "Giving up on model load; service stays in initializing state until restarted"
    );
    slot.set(LoadState::Failed {
        attempts: max_attempts,
        last_error,
    });
}
