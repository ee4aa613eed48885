//! Natural-language explanations from a local Ollama-compatible LLM.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use core_types::Explainer;
use serde::{Deserialize, Serialize};

pub const FALLBACK_EXPLANATION: &str = "Error: Could not get explanation from LLM.";
pub const DEFAULT_SIGNAL_PROMPT: &str = "Explain this trading signal in simple terms: {details}";
pub const DEFAULT_CHAT_PROMPT: &str = "Context: {context}\n\nUser query: {query}\n\nAnswer:";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExplainerConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub timeout_ms: u64,
    pub signal_prompt: String,
    pub chat_prompt: String,
    /// Request an explanation for every emitted signal.
    pub explain_signals: bool,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: "phi3".to_string(),
            timeout_ms: 60_000,
            signal_prompt: DEFAULT_SIGNAL_PROMPT.to_string(),
            chat_prompt: DEFAULT_CHAT_PROMPT.to_string(),
            explain_signals: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptBuilder {
    signal_template: String,
    chat_template: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_PROMPT, DEFAULT_CHAT_PROMPT)
    }
}

impl PromptBuilder {
    pub fn new(signal_template: impl Into<String>, chat_template: impl Into<String>) -> Self {
        Self {
            signal_template: signal_template.into(),
            chat_template: chat_template.into(),
        }
    }

    pub fn from_config(cfg: &ExplainerConfig) -> Self {
        Self::new(cfg.signal_prompt.clone(), cfg.chat_prompt.clone())
    }

    pub fn signal_prompt(&self, details: &str) -> String {
        self.signal_template.replace("{details}", details)
    }

    pub fn chat_prompt(&self, query: &str, context: &str) -> String {
        self.chat_template
            .replace("{context}", context)
            .replace("{query}", query)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Clone)]
pub struct LlmExplainer {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl LlmExplainer {
    pub fn new(cfg: &ExplainerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms.max(100)))
            .build()?;
        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
        })
    }

    async fn chat(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };
        let res = self
            .http
            .post(format!("{}/api/chat", self.endpoint))
            .json(&body)
            .send()
            .await
            .context("send chat request")?;
        if !res.status().is_success() {
            bail!("llm returned {}", res.status());
        }
        let parsed: ChatResponse = res.json().await.context("decode chat response")?;
        let content = parsed.message.content.trim().to_string();
        if content.is_empty() {
            bail!("llm returned an empty message");
        }
        Ok(content)
    }
}

#[async_trait]
impl Explainer for LlmExplainer {
    async fn explain(&self, prompt: &str) -> String {
        match self.chat(prompt).await {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(model = %self.model, ?err, "llm explanation failed");
                FALLBACK_EXPLANATION.to_string()
            }
        }
    }
}

/// Used when explanations are switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledExplainer;

#[async_trait]
impl Explainer for DisabledExplainer {
    async fn explain(&self, _prompt: &str) -> String {
        FALLBACK_EXPLANATION.to_string()
    }
}
