//! Anthropic Messages API provider with streamed responses.

use super::sse::{self, SseEvent, SseTranslator};
use super::{
    CreateMessageParams, EventStream, LlmProvider, ProviderHealth, ProviderHealthStatus, ResponseFormat, StreamEvent,
    Usage,
};
use crate::utils::time::now_ms;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

pub(crate) const JSON_ONLY_HINT: &str = "Respond with valid JSON only.";

/// Health probes slower than this are reported as degraded.
const SLOW_PROBE_MS: u64 = 5_000;

pub struct AnthropicProvider {
    id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
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

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn body(params: &CreateMessageParams) -> Value {
        let mut system = params.system.clone();
        if params.response_format == Some(ResponseFormat::Json) {
            system = Some(match system {
                | Some(s) => format!("{}\n\n{}", s, JSON_ONLY_HINT),
                | None => JSON_ONLY_HINT.to_string(),
            });
        }
        let mut body = json!({
            "model": params.model,
            "max_tokens": params.max_tokens,
            "messages": params.messages,
            "stream": true,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(tools) = params.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.input_schema}))
                    .collect(),
            );
        }
        body
    }

    async fn probe(&self) -> Result<(StatusCode, Vec<String>)> {
        let resp = self.request(reqwest::Method::GET, "/v1/models").send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Ok((status, Vec::new()));
        }
        let list: ModelList = resp.json().await?;
        Ok((status, list.data.into_iter().map(|m| m.id).collect()))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelList {
    #[serde(default)]
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelEntry {
    pub id: String,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_message(&self, params: &CreateMessageParams) -> Result<EventStream> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/messages")
            .json(&Self::body(params))
            .send()
            .await
            .map_err(|e| Error::provider(&self.id, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::provider(&self.id, format!("http {}: {}", status, body)));
        }
        debug!(provider = %self.id, model = %params.model, "streaming message");
        Ok(sse::translate(sse::sse_events(resp), AnthropicTranslator::new(&self.id)))
    }

    async fn health_check(&self) -> ProviderHealth {
        let started = Instant::now();
        let result = self.probe().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            | Ok((status, _)) if status.is_success() => ProviderHealth {
                provider_id: self.id.clone(),
                status: if latency_ms > SLOW_PROBE_MS {
                    ProviderHealthStatus::Degraded
                } else {
                    ProviderHealthStatus::Healthy
                },
                latency_ms,
                last_success: Some(now_ms()),
                last_error: None,
                cooldown_until: None,
            },
            | Ok((status, _)) if status == StatusCode::TOO_MANY_REQUESTS => ProviderHealth {
                provider_id: self.id.clone(),
                status: ProviderHealthStatus::RateLimited,
                latency_ms,
                last_success: None,
                last_error: Some(format!("http {}", status)),
                cooldown_until: Some(now_ms() + 60_000),
            },
            | Ok((status, _)) => {
                ProviderHealth { latency_ms, ..ProviderHealth::offline(&self.id, format!("http {}", status)) }
            }
            | Err(e) => ProviderHealth { latency_ms, ..ProviderHealth::offline(&self.id, e.to_string()) },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let (status, models) = self.probe().await.map_err(|e| Error::provider(&self.id, e.to_string()))?;
        if !status.is_success() {
            return Err(Error::provider(&self.id, format!("http {}", status)));
        }
        Ok(models)
    }
}

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    json: String,
}

/// Maps Anthropic stream events onto [`StreamEvent`]s.
pub(crate) struct AnthropicTranslator {
    provider_id: String,
    usage: Usage,
    tools: HashMap<u64, PendingTool>,
    stopped: bool,
    completed: bool,
}

impl AnthropicTranslator {
    pub(crate) fn new(provider_id: &str) -> Self {
        Self { provider_id: provider_id.to_string(), usage: Usage::default(), tools: HashMap::new(), stopped: false, completed: false }
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::provider(&self.provider_id, message)
    }
}

fn u64_at(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(Value::as_u64)
}

impl SseTranslator for AnthropicTranslator {
    fn on_event(&mut self, event: SseEvent) -> Result<Vec<StreamEvent>> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v: Value = serde_json::from_str(&event.data).map_err(|e| self.fail(format!("bad event payload: {}", e)))?;
        let kind = event.event.as_deref().or_else(|| v["type"].as_str()).unwrap_or_default().to_string();
        let mut out = Vec::new();
        match kind.as_str() {
            | "message_start" => {
                let usage = &v["message"]["usage"];
                self.usage.input = u64_at(usage, "input_tokens").unwrap_or(0);
                self.usage.output = u64_at(usage, "output_tokens").unwrap_or(0);
                self.usage.cache_creation = u64_at(usage, "cache_creation_input_tokens");
                self.usage.cache_read = u64_at(usage, "cache_read_input_tokens");
            }
            | "content_block_start" => {
                let block = &v["content_block"];
                if block["type"] == "tool_use" {
                    let index = u64_at(&v, "index").unwrap_or(0);
                    self.tools.insert(
                        index,
                        PendingTool {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            json: String::new(),
                        },
                    );
                }
            }
            | "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    | Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if !text.is_empty() {
                            out.push(StreamEvent::TextDelta { text: text.to_string() });
                        }
                    }
                    | Some("input_json_delta") => {
                        let index = u64_at(&v, "index").unwrap_or(0);
                        if let Some(tool) = self.tools.get_mut(&index) {
                            tool.json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    | _ => {}
                }
            }
            | "content_block_stop" => {
                let index = u64_at(&v, "index").unwrap_or(0);
                if let Some(tool) = self.tools.remove(&index) {
                    let input = if tool.json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&tool.json)
                            .map_err(|e| self.fail(format!("bad tool input for {}: {}", tool.name, e)))?
                    };
                    out.push(StreamEvent::ToolUse { id: tool.id, name: tool.name, input });
                }
            }
            | "message_delta" => {
                if let Some(output) = u64_at(&v["usage"], "output_tokens") {
                    self.usage.output = output;
                }
                out.push(StreamEvent::Usage(self.usage));
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stopped = true;
                    out.push(StreamEvent::Stop { reason: reason.to_string() });
                }
            }
            | "message_stop" => {
                self.completed = true;
                if !self.stopped {
                    self.stopped = true;
                    out.push(StreamEvent::Stop { reason: "end_turn".into() });
                }
            }
            | "error" => {
                let message = v["error"]["message"].as_str().unwrap_or("unknown stream error");
                let kind = v["error"]["type"].as_str().unwrap_or("error");
                return Err(self.fail(format!("{}: {}", kind, message)));
            }
            | _ => {}
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        if self.completed || self.stopped {
            Ok(Vec::new())
        } else {
            Err(self.fail("stream ended before message_stop"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{collect_text, Message};
    use axum::{http::HeaderMap, http::StatusCode as AxumStatus, response::IntoResponse, routing::get, routing::post, Router};
    use futures::StreamExt;
    use std::net::SocketAddr;

    fn ev(event: &str, data: Value) -> SseEvent {
        SseEvent { event: Some(event.to_string()), data: data.to_string() }
    }

    #[test]
    fn maps_text_usage_and_stop() {
        let mut t = AnthropicTranslator::new("anthropic");
        let mut out = Vec::new();
        out.extend(t.on_event(ev("message_start", json!({"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1,"cache_read_input_tokens":4}}}))).unwrap());
        out.extend(t.on_event(ev("ping", json!({"type":"ping"}))).unwrap());
        out.extend(t.on_event(ev("content_block_delta", json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"[]"}}))).unwrap());
        out.extend(t.on_event(ev("message_delta", json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}))).unwrap());
        out.extend(t.on_event(ev("message_stop", json!({"type":"message_stop"}))).unwrap());
        assert_eq!(
            out,
            vec![
                StreamEvent::TextDelta { text: "[]".into() },
                StreamEvent::Usage(Usage { input: 12, output: 7, cache_creation: None, cache_read: Some(4) }),
                StreamEvent::Stop { reason: "end_turn".into() },
            ]
        );
        assert!(t.finish().unwrap().is_empty());
    }

    #[test]
    fn accumulates_tool_input_until_block_stop() {
        let mut t = AnthropicTranslator::new("anthropic");
        assert!(t
            .on_event(ev("content_block_start", json!({"index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"rsi","input":{}}})))
            .unwrap()
            .is_empty());
        assert!(t
            .on_event(ev("content_block_delta", json!({"index":1,"delta":{"type":"input_json_delta","partial_json":"{\"values\": [1,"}})))
            .unwrap()
            .is_empty());
        t.on_event(ev("content_block_delta", json!({"index":1,"delta":{"type":"input_json_delta","partial_json":"2]}"}}))).unwrap();
        let out = t.on_event(ev("content_block_stop", json!({"index":1}))).unwrap();
        assert_eq!(out, vec![StreamEvent::ToolUse { id: "tu_1".into(), name: "rsi".into(), input: json!({"values":[1,2]}) }]);
    }

    #[test]
    fn error_event_and_truncation_fail() {
        let mut t = AnthropicTranslator::new("anthropic");
        let err = t
            .on_event(ev("error", json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}})))
            .unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
        assert!(AnthropicTranslator::new("anthropic").finish().is_err());
    }

    const STREAM: &str = concat!(
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"[\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"]\"}}\n\n",
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    );

    async fn messages(headers: HeaderMap, body: String) -> impl IntoResponse {
        let body: Value = serde_json::from_str(&body).unwrap();
        if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("good") {
            return (AxumStatus::UNAUTHORIZED, String::from("{\"error\":\"bad key\"}"));
        }
        assert_eq!(headers.get("anthropic-version").unwrap(), API_VERSION);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["system"], json!("sys\n\nRespond with valid JSON only."));
        (AxumStatus::OK, STREAM.to_string())
    }

    async fn models() -> impl IntoResponse {
        (AxumStatus::TOO_MANY_REQUESTS, "slow down")
    }

    async fn spawn_stub() -> SocketAddr {
        let app = Router::new().route("/v1/messages", post(messages)).route("/v1/models", get(models));
        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn params() -> CreateMessageParams {
        CreateMessageParams {
            model: "claude-3-5-haiku-20241022".into(),
            messages: vec![Message::user("hi")],
            system: Some("sys".into()),
            temperature: Some(0.3),
            max_tokens: 64,
            tools: None,
            response_format: Some(ResponseFormat::Json),
        }
    }

    #[tokio::test]
    async fn streams_from_http_endpoint() {
        let addr = spawn_stub().await;
        let provider = AnthropicProvider::with_base_url("anthropic", "good", &format!("http://{}", addr)).unwrap();
        let events: Vec<StreamEvent> =
            provider.create_message(&params()).await.unwrap().map(|e| e.unwrap()).collect().await;
        assert_eq!(collect_text(&events), "[]");
        assert_eq!(events.last(), Some(&StreamEvent::Stop { reason: "end_turn".into() }));
    }

    #[tokio::test]
    async fn http_error_is_a_provider_failure() {
        let addr = spawn_stub().await;
        let provider = AnthropicProvider::with_base_url("anthropic", "bad", &format!("http://{}", addr)).unwrap();
        let err = provider.create_message(&params()).await.err().unwrap();
        assert!(matches!(err, Error::Provider { ref provider_id, .. } if provider_id == "anthropic"));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn rate_limited_health() {
        let addr = spawn_stub().await;
        let provider = AnthropicProvider::with_base_url("anthropic", "good", &format!("http://{}", addr)).unwrap();
        let health = provider.health_check().await;
        assert_eq!(health.status, ProviderHealthStatus::RateLimited);
        assert!(provider.list_models().await.is_err());
    }
}
