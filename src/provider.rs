use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::generation::GenerationParams;
use crate::protocol::ChatMessage;

/// A loaded model together with its tokenizer and chat template.
///
/// Every method is synchronous and may be compute bound; callers run them on the
/// blocking pool (see [`crate::pool::WorkerPool`]).
pub trait ModelProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Renders `messages` into a prompt string without tokenizing it.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String>;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Runs autoregressive generation and returns the prompt ids followed by the
    /// newly produced ids. Implementations must return [`Cancelled`] once `cancel`
    /// fires.
    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("generation cancelled")]
pub struct Cancelled;
