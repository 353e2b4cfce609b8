//! Default Type Handlers — factories for well-known stage types (component J).

use super::rpc::{await_event, bus_request};
use crate::dag::{HandlerContext, StageHandler};
use crate::types::{BatchId, Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Maps a competition proposal type to the agent type expected to answer it.
/// Unknown proposal types default to `scene`.
pub fn proposal_agent_type(proposal_type: &str) -> &'static str {
    match proposal_type {
        "asset_placement" => "scene",
        "camera_move" => "camera",
        "story_advance" => "story",
        _ => "scene",
    }
}

struct LlmStageHandler {
    timeout: Duration,
}

#[async_trait]
impl StageHandler for LlmStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let timeout = ctx
            .stage
            .budget
            .time_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        bus_request(
            &ctx.bus,
            "orchestrator:llm:request",
            "orchestrator:llm:result",
            serde_json::json!({
                "stageId": ctx.stage.id,
                "stageConfig": ctx.stage.payload,
                "payload": ctx.stage.payload,
                "budget": ctx.stage.budget,
            }),
            timeout,
        )
        .await
    }
}

struct AudioStageHandler {
    timeout: Duration,
}

#[async_trait]
impl StageHandler for AudioStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let timeout = ctx
            .stage
            .budget
            .time_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        bus_request(
            &ctx.bus,
            "orchestrator:audio:request",
            "orchestrator:audio:result",
            serde_json::json!({
                "stageId": ctx.stage.id,
                "stageConfig": ctx.stage.payload,
            }),
            timeout,
        )
        .await
    }
}

struct McpStageHandler {
    service: String,
    timeout: Duration,
}

#[async_trait]
impl StageHandler for McpStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let timeout = ctx
            .stage
            .budget
            .time_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        bus_request(
            &ctx.bus,
            "orchestrator:mcp:request",
            "orchestrator:mcp:result",
            serde_json::json!({
                "stageId": ctx.stage.id,
                "mcpService": self.service,
                "tool": ctx.stage.payload.get("tool"),
                "command": ctx.stage.payload.get("command"),
                "args": ctx.stage.payload.get("args").cloned().unwrap_or(serde_json::Value::Null),
                "options": ctx.stage.payload.get("options").cloned().unwrap_or(serde_json::Value::Null),
                "mode": ctx.stage.payload.get("mode"),
                "methodArgs": ctx.stage.payload.get("methodArgs").cloned().unwrap_or(serde_json::Value::Null),
            }),
            timeout,
        )
        .await
    }
}

struct CompetitionStageHandler {
    proposal_timeout: Duration,
    execution_timeout: Duration,
}

#[async_trait]
impl StageHandler for CompetitionStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let batch_id = BatchId::new().to_string();
        let proposal_type = ctx
            .stage
            .payload
            .get("proposalType")
            .and_then(|v| v.as_str())
            .unwrap_or("asset_placement")
            .to_string();
        let expected_agents = ctx
            .stage
            .payload
            .get("expectedAgents")
            .cloned()
            .unwrap_or(serde_json::json!([]));
        let deadline = chrono::Utc::now() + chrono::Duration::from_std(self.proposal_timeout).unwrap_or_default();

        ctx.bus.lock().await.emit(
            "proposal:request",
            serde_json::json!({
                "batchId": batch_id,
                "proposalType": proposal_type,
                "context": ctx.stage.payload,
                "deadline": deadline.to_rfc3339(),
                "expectedAgents": expected_agents,
            }),
        );
        ctx.bus.lock().await.emit(
            "competition:start",
            serde_json::json!({ "batchId": batch_id, "proposalType": proposal_type }),
        );

        let total_timeout = self.proposal_timeout + self.execution_timeout;
        await_event(&ctx.bus, "competition:completed", "batchId", &batch_id, total_timeout).await
    }
}

struct SceneResetStageHandler {
    timeout: Duration,
}

#[async_trait]
impl StageHandler for SceneResetStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let mut errors = Vec::new();
        let mut details = serde_json::Map::new();

        match bus_request(
            &ctx.bus,
            "orchestrator:mcp:request",
            "orchestrator:mcp:result",
            serde_json::json!({ "mcpService": "worldbuilder", "command": "clearScene" }),
            self.timeout,
        )
        .await
        {
            Ok(v) => {
                details.insert("clearScene".to_string(), v);
            }
            Err(e) => errors.push(e.to_string()),
        }

        for command in ["clearWaypoints", "clearGroups"] {
            match bus_request(
                &ctx.bus,
                "orchestrator:mcp:request",
                "orchestrator:mcp:result",
                serde_json::json!({ "mcpService": "worldsurveyor", "command": command }),
                self.timeout,
            )
            .await
            {
                Ok(v) => {
                    details.insert(command.to_string(), v);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        if !errors.is_empty() {
            return Err(Error::mcp_error("scene-reset", errors.join("; ")));
        }
        Ok(serde_json::json!({ "cleared": true, "details": details }))
    }
}

struct SleepStageHandler;

#[async_trait]
impl StageHandler for SleepStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let duration_ms = ctx
            .stage
            .payload
            .get("durationMs")
            .and_then(|v| v.as_u64())
            .or(ctx.stage.budget.time_ms)
            .unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        Ok(serde_json::json!({ "slept": duration_ms }))
    }
}

struct NotifyStageHandler;

#[async_trait]
impl StageHandler for NotifyStageHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value> {
        let event_name = ctx
            .stage
            .payload
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("system:notified")
            .to_string();
        let payload = ctx.stage.payload.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        ctx.bus.lock().await.emit(event_name, payload);
        Ok(serde_json::json!({ "notified": true }))
    }
}

struct TrivialStageHandler;

#[async_trait]
impl StageHandler for TrivialStageHandler {
    async fn handle(&self, _ctx: HandlerContext) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "ok": true }))
    }
}

struct NoopStageHandler;

#[async_trait]
impl StageHandler for NoopStageHandler {
    async fn handle(&self, _ctx: HandlerContext) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "skipped": true }))
    }
}

/// Registers the well-known factories a fresh Orchestrator Manager starts with.
pub fn default_factories(config: &crate::types::AdventureConfig) -> Vec<(String, Arc<dyn StageHandler>)> {
    let llm: Arc<dyn StageHandler> = Arc::new(LlmStageHandler {
        timeout: Duration::from_millis(config.timeouts.llm_request_timeout_ms),
    });
    let audio: Arc<dyn StageHandler> = Arc::new(AudioStageHandler {
        timeout: Duration::from_millis(config.timeouts.audio_request_timeout_ms),
    });
    let competition: Arc<dyn StageHandler> = Arc::new(CompetitionStageHandler {
        proposal_timeout: Duration::from_millis(config.timeouts.proposal_timeout_ms),
        execution_timeout: Duration::from_millis(config.timeouts.judge_panel_timeout_ms),
    });
    let scene_reset: Arc<dyn StageHandler> = Arc::new(SceneResetStageHandler {
        timeout: Duration::from_millis(config.timeouts.mcp_request_timeout_ms),
    });
    let sleep: Arc<dyn StageHandler> = Arc::new(SleepStageHandler);
    let notify: Arc<dyn StageHandler> = Arc::new(NotifyStageHandler);
    let log: Arc<dyn StageHandler> = Arc::new(TrivialStageHandler);
    let noop: Arc<dyn StageHandler> = Arc::new(NoopStageHandler);

    let mcp_timeout = Duration::from_millis(config.timeouts.mcp_request_timeout_ms);
    let mut factories: Vec<(String, Arc<dyn StageHandler>)> = vec![
        ("llm".to_string(), llm),
        ("audio".to_string(), audio),
        ("competition".to_string(), competition),
        ("system:scene-reset".to_string(), scene_reset),
        ("system:sleep".to_string(), sleep),
        ("system:notify".to_string(), notify),
        ("log".to_string(), log),
        ("noop".to_string(), noop),
    ];
    for service in ["worldbuilder", "worldviewer", "worldsurveyor", "worldstreamer", "worldrecorder"] {
        let handler: Arc<dyn StageHandler> = Arc::new(McpStageHandler { service: service.to_string(), timeout: mcp_timeout });
        factories.push((format!("mcp:{service}"), handler));
    }
    factories
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_type_maps_to_agent_type() {
        assert_eq!(proposal_agent_type("asset_placement"), "scene");
        assert_eq!(proposal_agent_type("camera_move"), "camera");
        assert_eq!(proposal_agent_type("story_advance"), "story");
        assert_eq!(proposal_agent_type("unknown"), "scene");
    }

    #[test]
    fn default_factories_covers_every_mcp_service() {
        let config = crate::types::AdventureConfig::default();
        let factories = default_factories(&config);
        let names: Vec<&str> = factories.iter().map(|(name, _)| name.as_str()).collect();
        for service in ["worldbuilder", "worldviewer", "worldsurveyor", "worldstreamer", "worldrecorder"] {
            assert!(names.contains(&format!("mcp:{service}").as_str()));
        }
        assert!(names.contains(&"competition"));
        assert!(names.contains(&"noop"));
    }
}
