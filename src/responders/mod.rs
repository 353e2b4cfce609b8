//! Responders — long-lived subscribers translating bus requests into
//! external calls (component K).
//!
//! Each responder owns its external client behind a narrow trait object so
//! the core can be exercised against mocks; constructing the real HTTP/WS
//! clients is out of scope here.

use crate::bus::{Event, EventBus, SubscribeOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A single vendor completion, reusing the same response shape agents use.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, provider: &str, prompt: &serde_json::Value) -> crate::types::Result<LLMCompletion>;
}

pub struct LLMCompletion {
    pub model: String,
    pub text: String,
    pub usage: crate::ledger::UsageRecord,
    pub response_time_ms: u64,
}

#[derive(Debug, Deserialize)]
struct LLMRequestPayload {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Strips a leading/trailing markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_alphabetic());
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

pub struct LLMResponder {
    clients: HashMap<String, Arc<dyn LLMClient>>,
    default_provider: Option<String>,
}

impl LLMResponder {
    pub async fn spawn(bus: Arc<Mutex<EventBus>>, clients: HashMap<String, Arc<dyn LLMClient>>, default_provider: Option<String>) {
        let responder = Arc::new(Self { clients, default_provider });
        bus.lock().await.subscribe(
            "orchestrator:llm:request",
            move |event: Event| {
                let responder = responder.clone();
                let bus = bus.clone();
                async move {
                    responder.handle(&bus, event).await;
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
    }

    async fn handle(&self, bus: &Arc<Mutex<EventBus>>, event: Event) {
        let Ok(req) = serde_json::from_value::<LLMRequestPayload>(event.payload) else { return };
        let provider = req.provider.or_else(|| self.default_provider.clone());
        let Some(provider) = provider else {
            emit_error(bus, "orchestrator:llm:result", &req.request_id, "no provider configured").await;
            return;
        };
        let Some(client) = self.clients.get(&provider) else {
            emit_error(bus, "orchestrator:llm:result", &req.request_id, &format!("unknown provider '{provider}'")).await;
            return;
        };

        let start = std::time::Instant::now();
        match client.complete(&provider, &req.payload).await {
            Ok(completion) => {
                let text = strip_code_fence(&completion.text);
                let json_value = serde_json::from_str::<serde_json::Value>(text).ok();
                bus.lock().await.emit(
                    "orchestrator:llm:result",
                    serde_json::json!({
                        "requestId": req.request_id,
                        "provider": provider,
                        "model": completion.model,
                        "text": text,
                        "json": json_value,
                        "usage": {
                            "prompt": completion.usage.prompt,
                            "completion": completion.usage.completion,
                            "total": completion.usage.total,
                            "costUSD": completion.usage.cost_usd,
                        },
                        "responseTime": start.elapsed().as_millis() as u64,
                    }),
                );
            }
            Err(err) => emit_error(bus, "orchestrator:llm:result", &req.request_id, &err.to_string()).await,
        }
    }
}

/// MCP invocation shape a caller builds before dispatch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpInvocation {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, rename = "methodArgs")]
    pub method_args: serde_json::Value,
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn call_method(&self, method: &str, args: &serde_json::Value) -> crate::types::Result<serde_json::Value>;
    async fn execute_command(&self, tool: &str, args: &serde_json::Value, options: &serde_json::Value) -> crate::types::Result<serde_json::Value>;
}

#[derive(Debug, Deserialize)]
struct McpRequestPayload {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "mcpService")]
    mcp_service: String,
    #[serde(flatten)]
    invocation: McpInvocation,
}

pub struct MCPResponder {
    clients: HashMap<String, Arc<dyn McpClient>>,
}

impl MCPResponder {
    pub async fn spawn(bus: Arc<Mutex<EventBus>>, clients: HashMap<String, Arc<dyn McpClient>>) {
        let responder = Arc::new(Self { clients });
        bus.lock().await.subscribe(
            "orchestrator:mcp:request",
            move |event: Event| {
                let responder = responder.clone();
                let bus = bus.clone();
                async move {
                    responder.handle(&bus, event).await;
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
    }

    async fn handle(&self, bus: &Arc<Mutex<EventBus>>, event: Event) {
        let Ok(req) = serde_json::from_value::<McpRequestPayload>(event.payload) else { return };
        let Some(client) = self.clients.get(&req.mcp_service) else {
            emit_error(bus, "orchestrator:mcp:result", &req.request_id, &format!("unknown mcp service '{}'", req.mcp_service)).await;
            return;
        };

        let use_method = req.invocation.mode.as_deref() == Some("method") || req.invocation.tool.is_none();
        let result = if use_method {
            let method = req
                .invocation
                .command
                .clone()
                .unwrap_or_else(|| req.invocation.tool.clone().unwrap_or_default());
            client.call_method(&method, &req.invocation.method_args).await
        } else {
            let tool = req.invocation.tool.clone().unwrap_or_default();
            client.execute_command(&tool, &req.invocation.args, &req.invocation.options).await
        };

        match result {
            Ok(value) => {
                bus.lock().await.emit(
                    "orchestrator:mcp:result",
                    serde_json::json!({ "requestId": req.request_id, "result": value }),
                );
            }
            Err(err) => emit_error(bus, "orchestrator:mcp:result", &req.request_id, &err.to_string()).await,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    pub success: bool,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait AudioClient: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn update_channel(&self, channel: &str, payload: &serde_json::Value) -> ChannelResult;
    async fn control(&self, command: &str, payload: &serde_json::Value) -> ChannelResult;
}

const AUDIO_CHANNELS: [&str; 6] = ["narration", "commentary", "ambient", "music", "sfx", "effects"];

#[derive(Debug, Default, Deserialize)]
struct AudioRequestPayload {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(default)]
    updates: serde_json::Value,
    #[serde(default)]
    control: Option<serde_json::Value>,
    #[serde(default)]
    sync: Option<serde_json::Value>,
    #[serde(default)]
    optional: bool,
}

pub struct AudioResponder {
    client: Arc<dyn AudioClient>,
}

impl AudioResponder {
    pub async fn spawn(bus: Arc<Mutex<EventBus>>, client: Arc<dyn AudioClient>) {
        let responder = Arc::new(Self { client });
        bus.lock().await.subscribe(
            "orchestrator:audio:request",
            move |event: Event| {
                let responder = responder.clone();
                let bus = bus.clone();
                async move {
                    responder.handle(&bus, event).await;
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
    }

    async fn handle(&self, bus: &Arc<Mutex<EventBus>>, event: Event) {
        let Ok(req) = serde_json::from_value::<AudioRequestPayload>(event.payload) else { return };

        if !self.client.is_connected().await {
            if !req.optional {
                emit_error(bus, "orchestrator:audio:result", &req.request_id, "Audio service not connected").await;
                return;
            }
            bus.lock().await.emit(
                "orchestrator:audio:result",
                serde_json::json!({ "requestId": req.request_id, "status": "offline", "requests": [], "connected": false }),
            );
            return;
        }

        let mut requests = Vec::new();
        let mut warnings = Vec::new();

        if let Some(sync) = &req.sync {
            let result = self.client.control("register_sync", sync).await;
            if !result.success {
                warnings.push(result.message.clone().unwrap_or_else(|| "sync registration failed".to_string()));
            }
            requests.push(serde_json::json!({ "kind": "sync", "result": result }));
        }

        if let Some(updates) = req.updates.as_object() {
            for channel in AUDIO_CHANNELS {
                if let Some(payload) = updates.get(channel) {
                    let result = self.client.update_channel(channel, payload).await;
                    if !result.success && req.optional {
                        warnings.push(format!("{channel} update failed: {:?}", result.message));
                    }
                    requests.push(serde_json::json!({ "kind": "channel", "channel": channel, "result": result }));
                }
            }
        }

        if let Some(control) = &req.control {
            let command = control.get("command").and_then(|v| v.as_str()).unwrap_or("unknown");
            let result = self.client.control(command, control).await;
            requests.push(serde_json::json!({ "kind": "control", "command": command, "result": result }));
        }

        let status = if requests.is_empty() {
            "noop"
        } else if warnings.is_empty() {
            "queued"
        } else {
            "partial"
        };

        bus.lock().await.emit(
            "orchestrator:audio:result",
            serde_json::json!({
                "requestId": req.request_id,
                "status": status,
                "requests": requests,
                "warnings": if warnings.is_empty() { None } else { Some(warnings) },
                "connected": true,
            }),
        );
    }
}

async fn emit_error(bus: &Arc<Mutex<EventBus>>, event_type: &str, request_id: &str, message: &str) {
    bus.lock().await.emit(
        event_type,
        serde_json::json!({ "requestId": request_id, "error": message }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscribeOptions;

    struct EchoLLM;
    #[async_trait]
    impl LLMClient for EchoLLM {
        async fn complete(&self, _provider: &str, _payload: &serde_json::Value) -> crate::types::Result<LLMCompletion> {
            Ok(LLMCompletion {
                model: "mock-model".to_string(),
                text: "```json\n{\"ok\":true}\n```".to_string(),
                usage: crate::ledger::UsageRecord { total: 12, ..Default::default() },
                response_time_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn llm_responder_strips_fence_and_parses_json() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let mut clients: HashMap<String, Arc<dyn LLMClient>> = HashMap::new();
        clients.insert("anthropic".to_string(), Arc::new(EchoLLM));
        LLMResponder::spawn(bus.clone(), clients, Some("anthropic".to_string())).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.lock().await.subscribe(
            "orchestrator:llm:result",
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
        bus.lock().await.emit(
            "orchestrator:llm:request",
            serde_json::json!({ "requestId": "r1", "payload": {} }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload["json"], serde_json::json!({"ok": true}));
    }

    struct OfflineAudio;
    #[async_trait]
    impl AudioClient for OfflineAudio {
        async fn is_connected(&self) -> bool {
            false
        }
        async fn update_channel(&self, _channel: &str, _payload: &serde_json::Value) -> ChannelResult {
            ChannelResult { success: false, message: None, duration_ms: None }
        }
        async fn control(&self, _command: &str, _payload: &serde_json::Value) -> ChannelResult {
            ChannelResult { success: false, message: None, duration_ms: None }
        }
    }

    #[tokio::test]
    async fn audio_responder_errors_when_offline_and_not_optional() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        AudioResponder::spawn(bus.clone(), Arc::new(OfflineAudio)).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.lock().await.subscribe(
            "orchestrator:audio:result",
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
        bus.lock().await.emit(
            "orchestrator:audio:request",
            serde_json::json!({ "requestId": "r1", "optional": false }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let event = rx.try_recv().unwrap();
        assert!(event.payload.get("error").is_some());
    }
}
