use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::protocol::ChatMessage;
use crate::provider::ModelProvider;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
}

impl GenerationParams {
    /// Sampling is only enabled for a strictly positive temperature; zero means greedy.
    pub fn do_sample(&self) -> bool {
        self.temperature > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// The system prompt (when present) always comes first, followed by the request
/// messages in the order given.
pub fn build_prompt_messages(
    system_prompt: Option<&str>,
    messages: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut prompt = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        prompt.push(ChatMessage::system(system));
    }
    prompt.extend(messages.iter().cloned());
    prompt
}

/// Renders, tokenizes, generates and decodes one chat turn. Only tokens produced
/// after the prompt are decoded.
pub fn complete(
    provider: &dyn ModelProvider,
    messages: &[ChatMessage],
    params: &GenerationParams,
    cancel: &CancellationToken,
) -> Result<Completion> {
    let prompt = provider
        .apply_chat_template(messages, true)
        .context("failed to apply chat template")?;
    tracing::trace!(prompt = %prompt, "Rendered chat template");

    let input_ids = provider.encode(&prompt).context("failed to tokenize prompt")?;
    let output_ids = provider.generate(&input_ids, params, cancel)?;

    let generated = new_tokens(&input_ids, &output_ids, params.max_new_tokens);
    let text = provider
        .decode(generated, true)
        .context("failed to decode generated tokens")?;

    Ok(Completion {
        text,
        prompt_tokens: input_ids.len(),
        completion_tokens: generated.len(),
    })
}

fn new_tokens<'a>(input_ids: &[u32], output_ids: &'a [u32], max_new_tokens: usize) -> &'a [u32] {
    let generated = output_ids.get(input_ids.len()..).unwrap_or(&[]);
    &generated[..generated.len().min(max_new_tokens)]
}
