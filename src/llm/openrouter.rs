//! OpenRouter provider speaking the OpenAI-compatible chat completions API.

use super::anthropic::{ModelList, JSON_ONLY_HINT};
use super::sse::{self, SseEvent, SseTranslator};
use super::{
    CreateMessageParams, EventStream, LlmProvider, ProviderHealth, ProviderHealthStatus, ResponseFormat, Role,
    StreamEvent, Usage,
};
use crate::utils::time::now_ms;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";

pub struct OpenRouterProvider {
    id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterProvider {
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(id, api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(id: impl Into<String>, api_key: impl Into<String>, base_url: &str) -> Result<Self> {
        url::Url::parse(base_url)?;
        Ok(Self {
            id: id.into(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().connect_timeout(Duration::from_secs(10)).build()?,
        })
    }

    fn body(params: &CreateMessageParams) -> Value {
        let mut messages = Vec::new();
        let mut system = params.system.clone();
        if params.response_format == Some(ResponseFormat::Json) {
            system = Some(match system {
                | Some(s) => format!("{}\n\n{}", s, JSON_ONLY_HINT),
                | None => JSON_ONLY_HINT.to_string(),
            });
        }
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &params.messages {
            let role = match m.role {
                | Role::User => "user",
                | Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": m.content}));
        }
        let mut body = json!({
            "model": params.model,
            "max_tokens": params.max_tokens,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(tools) = params.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {"name": t.name, "description": t.description, "parameters": t.input_schema},
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_message(&self, params: &CreateMessageParams) -> Result<EventStream> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Title", "tickscope")
            .json(&Self::body(params))
            .send()
            .await
            .map_err(|e| Error::provider(&self.id, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::provider(&self.id, format!("http {}: {}", status, body)));
        }
        debug!(provider = %self.id, model = %params.model, "streaming chat completion");
        Ok(sse::translate(sse::sse_events(resp), OpenRouterTranslator::new(&self.id)))
    }

    async fn health_check(&self) -> ProviderHealth {
        let started = Instant::now();
        let result = self.list_models().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            | Ok(_) => ProviderHealth {
                provider_id: self.id.clone(),
                status: ProviderHealthStatus::Healthy,
                latency_ms,
                last_success: Some(now_ms()),
                last_error: None,
                cooldown_until: None,
            },
            | Err(e) if e.to_string().contains("429") => ProviderHealth {
                status: ProviderHealthStatus::RateLimited,
                latency_ms,
                ..ProviderHealth::offline(&self.id, e.to_string())
            },
            | Err(e) => ProviderHealth { latency_ms, ..ProviderHealth::offline(&self.id, e.to_string()) },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Error::provider(&self.id, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::provider(&self.id, format!("http {}", status)));
        }
        let list: ModelList = resp.json().await.map_err(|e| Error::provider(&self.id, e.to_string()))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Maps chat-completion chunks onto [`StreamEvent`]s. Tool call fragments
/// are keyed by their index and emitted once the choice finishes.
pub(crate) struct OpenRouterTranslator {
    provider_id: String,
    calls: BTreeMap<u64, PendingCall>,
    stop_reason: Option<String>,
    done: bool,
}

impl OpenRouterTranslator {
    pub(crate) fn new(provider_id: &str) -> Self {
        Self { provider_id: provider_id.to_string(), calls: BTreeMap::new(), stop_reason: None, done: false }
    }

    fn drain_calls(&mut self) -> Result<Vec<StreamEvent>> {
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .map(|call| {
                let input = if call.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.arguments).map_err(|e| {
                        Error::provider(&self.provider_id, format!("bad tool arguments for {}: {}", call.name, e))
                    })?
                };
                Ok(StreamEvent::ToolUse { id: call.id, name: call.name, input })
            })
            .collect()
    }
}

impl SseTranslator for OpenRouterTranslator {
    fn on_event(&mut self, event: SseEvent) -> Result<Vec<StreamEvent>> {
        let data = event.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            self.done = true;
            let mut out = self.drain_calls()?;
            if let Some(reason) = self.stop_reason.take() {
                out.push(StreamEvent::Stop { reason });
            }
            return Ok(out);
        }
        let v: Value = serde_json::from_str(data)
            .map_err(|e| Error::provider(&self.provider_id, format!("bad chunk: {}", e)))?;
        if let Some(err) = v.get("error") {
            let message = err["message"].as_str().unwrap_or("unknown stream error");
            return Err(Error::provider(&self.provider_id, message));
        }

        let mut out = Vec::new();
        if let Some(choice) = v["choices"].get(0) {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
                out.push(StreamEvent::TextDelta { text: text.to_string() });
            }
            if let Some(calls) = delta["tool_calls"].as_array() {
                for call in calls {
                    let index = call["index"].as_u64().unwrap_or(0);
                    let pending = self.calls.entry(index).or_default();
                    if let Some(id) = call["id"].as_str() {
                        pending.id = id.to_string();
                    }
                    if let Some(name) = call["function"]["name"].as_str() {
                        pending.name.push_str(name);
                    }
                    if let Some(args) = call["function"]["arguments"].as_str() {
                        pending.arguments.push_str(args);
                    }
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                out.extend(self.drain_calls()?);
                self.stop_reason = Some(reason.to_string());
            }
        }
        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            out.push(StreamEvent::Usage(Usage {
                input: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output: usage["completion_tokens"].as_u64().unwrap_or(0),
                cache_creation: None,
                cache_read: usage["prompt_tokens_details"]["cached_tokens"].as_u64(),
            }));
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        match self.stop_reason.take() {
            | Some(reason) => {
                let mut out = self.drain_calls()?;
                out.push(StreamEvent::Stop { reason });
                Ok(out)
            }
            | None => Err(Error::provider(&self.provider_id, "stream ended before completion")),
        }
    }
}
