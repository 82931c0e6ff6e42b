//! Chat template rendering.
//!
//! Hugging Face models ship a Jinja template in `tokenizer_config.json` that
//! turns role-tagged messages into a single prompt string. It is rendered here
//! with minijinja, which has Python-compatible string methods enabled so
//! upstream templates (`.strip()`, `.startswith()`, ...) work as written.

use anyhow::{Context, Result};
use minijinja::{context, Environment, ErrorKind};
use serde::Deserialize;

use crate::protocol::ChatMessage;

/// ChatML, the native format of the Qwen family. Used when a tokenizer config carries
/// no template of its own.
pub const CHATML_TEMPLATE: &str = "{%- for message in messages %}{{ '<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n' }}{%- endfor %}{%- if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{%- endif %}";

const TEMPLATE_NAME: &str = "chat";

#[derive(Debug)]
pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

// Special tokens are either plain strings or AddedToken objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenValue {
    Literal(String),
    Added { content: String },
}

impl TokenValue {
    fn into_content(self) -> String {
        match self {
            TokenValue::Literal(s) => s,
            TokenValue::Added { content } => content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<serde_json::Value>,
    #[serde(default)]
    bos_token: Option<TokenValue>,
    #[serde(default)]
    eos_token: Option<TokenValue>,
}

fn raise_exception(msg: String) -> std::result::Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", raise_exception);
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .context("invalid chat template")?;

        Ok(Self {
            env,
            bos_token,
            eos_token,
        })
    }

    pub fn chatml() -> Result<Self> {
        Self::new(CHATML_TEMPLATE, None, Some("<|im_end|>".to_string()))
    }

    /// Builds a template from the contents of a `tokenizer_config.json`.
    pub fn from_tokenizer_config(json: &str) -> Result<Self> {
        let config: TokenizerConfig =
            serde_json::from_str(json).context("failed to parse tokenizer_config.json")?;

        let source = match config.chat_template {
            Some(serde_json::Value::String(template)) => template,
            Some(_) => {
                tracing::warn!("Unsupported chat_template layout in tokenizer config, using ChatML");
                CHATML_TEMPLATE.to_string()
            }
            None => {
                tracing::warn!("Tokenizer config has no chat_template, using ChatML");
                CHATML_TEMPLATE.to_string()
            }
        };

        Self::new(
            source,
            config.bos_token.map(TokenValue::into_content),
            config.eos_token.map(TokenValue::into_content),
        )
    }

    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        let rendered = template
            .render(context! {
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => self.bos_token.as_deref().unwrap_or_default(),
                eos_token => self.eos_token.as_deref().unwrap_or_default(),
            })
            .context("failed to render chat template")?;
        Ok(rendered)
    }
}
