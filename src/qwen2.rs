//! Qwen2-family causal language models on candle.
//!
//! Weights are memory-mapped from safetensors shards; the KV cache lives inside
//! the model, so generations are serialized by a mutex and the cache is cleared
//! at the start of each one.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM};
use candle_transformers::utils::apply_repeat_penalty;
use serde::Deserialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokenizers::Tokenizer;
use tokio_util::sync::CancellationToken;

use crate::config::{DTypeChoice, ModelSource};
use crate::generation::GenerationParams;
use crate::hub::{self, ModelFiles};
use crate::protocol::ChatMessage;
use crate::provider::{Cancelled, ModelProvider};
use crate::template::ChatTemplate;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

/// Sampling defaults shipped in a model's `generation_config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl GenerationDefaults {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse generation_config.json")
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(TokenIds::One(id)) => vec![*id],
            Some(TokenIds::Many(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }

    /// Greedy when `temperature` is zero; otherwise temperature sampling narrowed by
    /// whichever of top-k / top-p the model enables.
    pub fn sampling(&self, temperature: f64) -> Sampling {
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let k = self.top_k.filter(|&k| k > 0);
        let p = self.top_p.filter(|&p| p > 0.0 && p < 1.0);
        match (k, p) {
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (None, None) => Sampling::All { temperature },
        }
    }

    pub fn repeat_penalty(&self) -> f32 {
        self.repetition_penalty.unwrap_or(1.0)
    }
}

pub struct Qwen2Provider {
    model_id: String,
    model: Mutex<ModelForCausalLM>,
    tokenizer: Tokenizer,
    template: ChatTemplate,
    device: Device,
    defaults: GenerationDefaults,
    eos_token_ids: Vec<u32>,
    max_position_embeddings: usize,
    seed: Option<u64>,
}

impl std::fmt::Debug for Qwen2Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qwen2Provider")
            .field("model_id", &self.model_id)
            .field("device", &self.device)
            .field("eos_token_ids", &self.eos_token_ids)
            .finish_non_exhaustive()
    }
}

impl Qwen2Provider {
    /// Fetches the model files and builds the model on the blocking pool.
    pub async fn load(source: &ModelSource) -> Result<Self> {
        let files = hub::fetch(source).await?;
        let source = source.clone();
        tokio::task::spawn_blocking(move || Self::from_files(&source, &files))
            .await
            .context("model loading task panicked")?
    }

    pub fn from_files(source: &ModelSource, files: &ModelFiles) -> Result<Self> {
        let config_json = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let raw: serde_json::Value =
            serde_json::from_str(&config_json).context("failed to parse config.json")?;
        match raw.get("model_type").and_then(|v| v.as_str()) {
            Some("qwen2") => {}
            other => anyhow::bail!(
                "unsupported model_type {:?}; only qwen2 checkpoints are supported",
                other.unwrap_or("<missing>")
            ),
        }
        let max_position_embeddings = raw
            .get("max_position_embeddings")
            .and_then(|v| v.as_u64())
            .unwrap_or(32_768) as usize;
        let config: Qwen2Config =
            serde_json::from_value(raw).context("invalid qwen2 config.json")?;

        let device = select_device(source.cpu);
        let dtype = select_dtype(source.dtype, &device);
        tracing::info!(device = ?device, dtype = ?dtype, "Selected device placement");

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))?;

        let template = match &files.tokenizer_config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                ChatTemplate::from_tokenizer_config(&json)?
            }
            None => ChatTemplate::chatml()?,
        };

        let defaults = match &files.generation_config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                GenerationDefaults::from_json(&json)?
            }
            None => GenerationDefaults::default(),
        };

        let mut eos_token_ids = defaults.eos_token_ids();
        if eos_token_ids.is_empty() {
            if let Some(id) = template.eos_token().and_then(|t| tokenizer.token_to_id(t)) {
                eos_token_ids.push(id);
            }
        }
        if eos_token_ids.is_empty() {
            tracing::warn!("No EOS token found; generation only stops at max_tokens");
        }

        tracing::info!(shards = files.weights.len(), "Loading weights");
        // Safety: the shards are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = ModelForCausalLM::new(&config, vb).context("failed to build qwen2 model")?;

        Ok(Self {
            model_id: source.model_id.clone(),
            model: Mutex::new(model),
            tokenizer,
            template,
            device,
            defaults,
            eos_token_ids,
            max_position_embeddings,
            seed: source.seed,
        })
    }
}

fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }
    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(e) => tracing::warn!("CUDA initialization failed: {}, trying other devices", e),
        }
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(e) => tracing::warn!("Metal initialization failed: {}, falling back to CPU", e),
        }
    }
    Device::Cpu
}

fn select_dtype(choice: DTypeChoice, device: &Device) -> DType {
    match choice {
        DTypeChoice::Auto if matches!(device, Device::Cpu) => DType::F32,
        DTypeChoice::Auto | DTypeChoice::Bf16 => DType::BF16,
        DTypeChoice::F16 => DType::F16,
        DTypeChoice::F32 => DType::F32,
    }
}

/// Fails when the prompt plus the requested completion would not fit in the
/// model's context window.
pub fn check_context_window(
    prompt_tokens: usize,
    max_new_tokens: usize,
    max_position_embeddings: usize,
) -> Result<()> {
    let fits = prompt_tokens
        .checked_add(max_new_tokens)
        .is_some_and(|total| total <= max_position_embeddings);
    if !fits {
        anyhow::bail!(
            "prompt of {prompt_tokens} tokens plus max_tokens {max_new_tokens} exceeds the context window of {max_position_embeddings}"
        );
    }
    Ok(())
}

/// Locks the model even if an earlier generation panicked while holding it.
/// The KV cache is cleared before every generation, so nothing stale survives.
pub fn lock_model<T>(model: &Mutex<T>) -> MutexGuard<'_, T> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelProvider for Qwen2Provider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        self.template.render(messages, add_generation_prompt)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Error tokenizing input: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        if input_ids.is_empty() {
            anyhow::bail!("cannot generate from an empty prompt");
        }
        check_context_window(
            input_ids.len(),
            params.max_new_tokens,
            self.max_position_embeddings,
        )?;

        let mut model = lock_model(&self.model);
        model.clear_kv_cache();

        let seed = self.seed.unwrap_or_else(rand::random);
        let mut logits_processor =
            LogitsProcessor::from_sampling(seed, self.defaults.sampling(params.temperature));
        let repeat_penalty = self.defaults.repeat_penalty();

        let mut tokens = input_ids.to_vec();
        let mut offset = 0;
        for step in 0..params.max_new_tokens {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let context = if step == 0 {
                &tokens[..]
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, offset)?;
            offset += context.len();

            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if repeat_penalty != 1.0 {
                apply_repeat_penalty(&logits, repeat_penalty, &tokens)?
            } else {
                logits
            };

            let next = logits_processor.sample(&logits)?;
            tokens.push(next);
            if self.eos_token_ids.contains(&next) {
                break;
            }
        }

        Ok(tokens)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Error de-tokenizing output: {e}"))
    }
}
