use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::TransformError;
use crate::item::{DataItem, ModelResponse};
use crate::node::Transform;
use crate::params::Params;

pub const SUMMARIZE_STAGE: &str = "summarize";
pub const BLOG_STAGE: &str = "openai_blog";
pub const CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

pub const SYSTEM_PROMPT: &str = "system_prompt";
pub const USER_PROMPT: &str = "user_prompt";
pub const MODEL: &str = "model";
pub const TEMPERATURE: &str = "temperature";
pub const MAX_TOKENS: &str = "max_tokens";
pub const TOP_P: &str = "top_p";
pub const FREQUENCY_PENALTY: &str = "frequency_penalty";
pub const PRESENCE_PENALTY: &str = "presence_penalty";
pub const MAX_CONTEXT_LENGTH: &str = "max_context_length";

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_MAX_CONTEXT: usize = 16000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl ChatRequest {
    /// System and user messages with the model options read from `params`.
    pub fn new(params: &Params, system: &str, user: String) -> Self {
        let num = |key: &str, default: f64| params.get(key).and_then(Value::as_f64).unwrap_or(default);
        Self {
            model: params.get_str(MODEL).unwrap_or(DEFAULT_MODEL).to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: user,
                },
            ],
            temperature: num(TEMPERATURE, 0.7),
            max_tokens: params.get(MAX_TOKENS).and_then(Value::as_u64).unwrap_or(100),
            top_p: num(TOP_P, 1.0),
            frequency_penalty: num(FREQUENCY_PENALTY, 0.0),
            presence_penalty: num(PRESENCE_PENALTY, 0.0),
        }
    }

    pub fn user_message(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// A chat-completions backend.
pub trait ChatClient {
    fn complete(&mut self, request: &ChatRequest) -> Result<String, TransformError>;
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible HTTP client.
#[derive(Debug)]
pub struct OpenAiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl ChatClient for OpenAiClient {
    fn complete(&mut self, request: &ChatRequest) -> Result<String, TransformError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TransformError::Model("OPENAI_API_KEY is not set".into()))?;

        let start = Instant::now();
        let body: CompletionResponse = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(request)
            .send()?
            .error_for_status()?
            .json()?;
        debug!(model = %request.model, latency_ms = start.elapsed().as_millis() as u64, "completion");

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Any item in, ModelResponse out.
pub struct ChatTransform<C> {
    client: C,
}

impl<C: ChatClient> ChatTransform<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: ChatClient> Transform for ChatTransform<C> {
    fn apply(&mut self, item: DataItem, params: &Params) -> Result<DataItem, TransformError> {
        let system_prompt = params.get_str(SYSTEM_PROMPT).unwrap_or("").to_string();
        let user_prompt = params.get_str(USER_PROMPT).unwrap_or("").to_string();
        let limit = params
            .get(MAX_CONTEXT_LENGTH)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CONTEXT);

        let message = truncate_chars(&format!("{}\n\n{}", user_prompt, render(&item)?), limit);
        let request = ChatRequest::new(params, &system_prompt, message);
        debug!(key = %item.key(), prompt_chars = request.user_message().chars().count(), "prompt built");
        let response = self.client.complete(&request)?.trim().to_string();
        if response.is_empty() {
            return Err(TransformError::Model(format!(
                "empty response for {}",
                item.key()
            )));
        }

        info!("Generated model response for {}", item.key());
        Ok(DataItem::Response(ModelResponse {
            source: item.key().to_string(),
            system_prompt,
            user_prompt: request.user_message().to_string(),
            response,
        }))
    }
}

/// The item as prompt context.
fn render(item: &DataItem) -> Result<String, TransformError> {
    Ok(match item {
        DataItem::Url(u) => format!("URL: {}", u.address),
        DataItem::Page(p) => format!("Webpage content:\n{}", p.html),
        DataItem::Document(d) => format!("Markdown content:\n{}", d.body),
        DataItem::Record(r) => format!(
            "Amazon product details:\n{}",
            serde_json::to_string_pretty(r).map_err(|e| TransformError::Extraction(e.to_string()))?
        ),
        DataItem::Response(m) => format!("Previous response:\n{}", m.response),
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ── Tests ──
