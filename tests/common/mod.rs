#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use qwq_serve::protocol::DEFAULT_SYSTEM_PROMPT;
use qwq_serve::provider::Cancelled;
use qwq_serve::{AppState, ChatMessage, GenerationParams, ModelProvider, ModelSlot, WorkerPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Token id outside the char range, decoded as `<|end|>` unless special tokens are skipped.
pub const END_TOKEN: u32 = 0x11_0000;

pub const REPLY: &str = "The answer is 4.";

/// Char-level stand-in for a real model: each char is one token and the reply is fixed.
#[derive(Default)]
pub struct FakeProvider {
    pub rendered: Mutex<Vec<Vec<ChatMessage>>>,
    pub params: Mutex<Vec<GenerationParams>>,
    samples: AtomicU64,
    fail_with: Option<String>,
    slow: bool,
    overshoot: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Never finishes on its own; only returns once cancelled.
    pub fn slow() -> Self {
        Self {
            slow: true,
            ..Self::default()
        }
    }

    /// Ignores `max_new_tokens` and returns the whole reply.
    pub fn overshooting() -> Self {
        Self {
            overshoot: true,
            ..Self::default()
        }
    }

    pub fn last_rendered(&self) -> Vec<ChatMessage> {
        self.rendered.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn last_params(&self) -> Option<GenerationParams> {
        self.params.lock().unwrap().last().copied()
    }
}

impl ModelProvider for FakeProvider {
    fn model_id(&self) -> &str {
        "fake/QwQ-32B-Preview"
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> anyhow::Result<String> {
        self.rendered.lock().unwrap().push(messages.to_vec());
        let mut text: String = messages
            .iter()
            .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
            .collect();
        if add_generation_prompt {
            text.push_str("assistant: ");
        }
        Ok(text)
    }

    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<u32>> {
        self.params.lock().unwrap().push(*params);
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }
        if self.slow {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(Cancelled.into());
        }

        let mut reply = REPLY.to_string();
        if params.do_sample() {
            let n = self.samples.fetch_add(1, Ordering::SeqCst);
            reply.push_str(&format!(" ({n})"));
        }
        let reply: Vec<u32> = reply.chars().map(u32::from).collect();

        let mut out = input_ids.to_vec();
        if self.overshoot {
            out.extend(&reply);
            out.push(END_TOKEN);
        } else {
            out.extend(reply.iter().take(params.max_new_tokens));
            if reply.len() < params.max_new_tokens {
                out.push(END_TOKEN);
            }
        }
        Ok(out)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        let mut text = String::new();
        for &id in ids {
            match char::from_u32(id) {
                Some(c) => text.push(c),
                None if skip_special_tokens => {}
                None => text.push_str("<|end|>"),
            }
        }
        Ok(text)
    }
}

pub fn app_state(slot: Arc<ModelSlot>, pool: WorkerPool) -> AppState {
    AppState {
        slot,
        pool: Arc::new(pool),
        model_name: "QwQ-32B-Preview".into(),
        default_system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
    }
}

pub fn ready_state(provider: Arc<FakeProvider>) -> AppState {
    let slot = Arc::new(ModelSlot::ready(provider));
    app_state(slot, WorkerPool::new(1, None))
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    use tower::ServiceExt;

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}
