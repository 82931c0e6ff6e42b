use clap::{Args, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::loader::LoadPolicy;
use crate::protocol::DEFAULT_SYSTEM_PROMPT;

pub const DEFAULT_MODEL_ID: &str = "Qwen/QwQ-32B-Preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DTypeChoice {
    /// bf16 on an accelerator, f32 on CPU
    #[default]
    Auto,
    Bf16,
    F16,
    F32,
}

/// Where to find the model and how to place it.
#[derive(Debug, Clone, Args)]
pub struct ModelSource {
    /// Hugging Face repo id, or a local directory with the same layout
    #[arg(long = "model", env = "MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub revision: String,

    /// Hugging Face API token for gated or private repos
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    #[arg(long, value_enum, default_value_t = DTypeChoice::Auto)]
    pub dtype: DTypeChoice,

    /// Run on CPU even when an accelerator is available
    #[arg(long)]
    pub cpu: bool,

    /// Fixed sampling seed; a fresh seed is drawn per request when unset
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,
}

impl ModelSource {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: "main".to_string(),
            hf_token: None,
            dtype: DTypeChoice::Auto,
            cpu: false,
            seed: None,
        }
    }

    /// Short model name shown on the root endpoint, e.g. `QwQ-32B-Preview`.
    pub fn display_name(&self) -> &str {
        let trimmed = self.model_id.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    #[command(flatten)]
    pub model: ModelSource,

    /// Maximum number of generations running at once
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 1)]
    pub max_concurrency: usize,

    /// Abort a chat request that has not finished after this many seconds
    #[arg(long, env = "GENERATION_TIMEOUT_SECS")]
    pub generation_timeout_secs: Option<u64>,

    /// Number of model load attempts before giving up
    #[arg(long, env = "LOAD_ATTEMPTS", default_value_t = 5)]
    pub load_attempts: u32,

    #[arg(long, env = "LOAD_BACKOFF_MS", default_value_t = 2_000)]
    pub load_backoff_ms: u64,

    #[arg(long, env = "LOAD_BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub load_backoff_max_ms: u64,

    /// System prompt used when a request does not carry one; empty disables it
    #[arg(long, env = "SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,
}

impl ServeArgs {
    pub fn into_config(self) -> anyhow::Result<ServeConfig> {
        let ip: IpAddr = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen host {}: {}", self.host, e))?;
        let addr = SocketAddr::new(ip, self.port);
        if self.max_concurrency == 0 {
            anyhow::bail!("--max-concurrency must be at least 1");
        }

        Ok(ServeConfig {
            addr,
            model: self.model,
            max_concurrency: self.max_concurrency,
            generation_timeout: self.generation_timeout_secs.map(Duration::from_secs),
            load_policy: LoadPolicy {
                max_attempts: self.load_attempts.max(1),
                initial_backoff: Duration::from_millis(self.load_backoff_ms),
                max_backoff: Duration::from_millis(self.load_backoff_max_ms),
            },
            system_prompt: self.system_prompt,
        })
    }
}

/// Resolved runtime configuration for [`crate::ModelManager`].
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub addr: SocketAddr,
    pub model: ModelSource,
    pub max_concurrency: usize,
    pub generation_timeout: Option<Duration>,
    pub load_policy: LoadPolicy,
    pub system_prompt: String,
}

impl ServeConfig {
    pub fn new(model: ModelSource) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            model,
            max_concurrency: 1,
            generation_timeout: None,
            load_policy: LoadPolicy::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}
