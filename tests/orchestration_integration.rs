//! End-to-end integration tests wiring the Event Bus, Story State, Proposal
//! Batch Manager, Judge Panel, and DAG Runner together without any network
//! boundary.

use adventure_core::agent::{Proposal, ProviderClient, ProviderResponse};
use adventure_core::batch::ProposalBatchManager;
use adventure_core::bus::EventBus;
use adventure_core::dag::{DagConfig, DagRunner, HandlerContext, Stage, StageHandler};
use adventure_core::judge::{Confidence, Judge, JudgeEvaluation, JudgePanel, JudgeSpec};
use adventure_core::ledger::UsageRecord;
use adventure_core::types::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

struct StaticRuleJudge {
    id: String,
    nominee: String,
}

#[async_trait]
impl Judge for StaticRuleJudge {
    async fn evaluate(&self, _proposals: &[Proposal]) -> Result<JudgeEvaluation> {
        Ok(JudgeEvaluation {
            judge_id: self.id.clone(),
            nominee: self.nominee.clone(),
            confidence: Confidence::High,
            notes: Some("static rule".to_string()),
        })
    }
}

struct FixedClient {
    text: &'static str,
}

#[async_trait]
impl ProviderClient for FixedClient {
    async fn complete(&self, _challenge: &adventure_core::agent::Challenge) -> Result<ProviderResponse> {
        Ok(ProviderResponse {
            data: json!({ "layout": self.text }),
            reasoning: "because".to_string(),
            summary: None,
            spatial: None,
            usage: UsageRecord { prompt: 10, completion: 10, total: 20, cost_usd: 0.0 },
        })
    }
}

#[tokio::test]
async fn proposal_batch_feeds_into_judge_decision() {
    let bus = Arc::new(Mutex::new(EventBus::default()));
    let _manager = ProposalBatchManager::new(bus.clone()).await;

    bus.lock().await.emit(
        "proposal:request",
        json!({
            "batchId": "batch-1",
            "proposalType": "asset_placement",
            "context": {},
            "deadline": (Utc::now() + chrono::Duration::seconds(5)).to_rfc3339(),
            "expectedAgents": ["agent-a", "agent-b"],
        }),
    );

    for (agent, layout) in [("agent-a", "castle"), ("agent-b", "forest")] {
        let proposal = json!({
            "batchId": "batch-1",
            "agentId": agent,
            "proposalType": "asset_placement",
            "data": { "layout": layout },
            "reasoning": "test",
            "timestamp": Utc::now().to_rfc3339(),
            "tokensUsed": 5,
        });
        bus.lock().await.emit("proposal:submit", json!({ "batchId": "batch-1", "agentId": agent, "proposal": proposal }));
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.lock().await.subscribe(
        "competition:completed",
        move |event: adventure_core::bus::Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.payload);
                Ok(())
            }
        },
        Default::default(),
    );
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let completion = rx.try_recv().expect("batch should have resolved");
    let proposals: Vec<Proposal> = serde_json::from_value(completion["proposals"].clone()).unwrap();
    assert_eq!(proposals.len(), 2);

    let panel = JudgePanel::new(
        vec![
            JudgeSpec {
                id: "judge-1".to_string(),
                specialty: "tech".to_string(),
                weight: 1.0,
                strictness: 1.0,
                judge: Arc::new(StaticRuleJudge { id: "judge-1".to_string(), nominee: "agent-a".to_string() }),
            },
            JudgeSpec {
                id: "judge-2".to_string(),
                specialty: "story".to_string(),
                weight: 1.0,
                strictness: 1.0,
                judge: Arc::new(StaticRuleJudge { id: "judge-2".to_string(), nominee: "agent-a".to_string() }),
            },
        ],
        None,
    );
    let decision = panel.evaluate_batch("batch-1", &proposals).await;
    assert_eq!(decision.winner.as_deref(), Some("agent-a"));
}

#[tokio::test]
async fn dag_runner_drives_scene_construction_style_pipeline() {
    let bus = Arc::new(Mutex::new(EventBus::default()));
    let dag = DagConfig {
        id: "scene-construction".to_string(),
        description: None,
        stages: vec![
            Stage {
                id: "clear-scene".to_string(),
                stage_type: "noop".to_string(),
                depends_on: vec![],
                retry: Default::default(),
                budget: Default::default(),
                payload: serde_json::Value::Null,
                optional: false,
            },
            Stage {
                id: "create-batch".to_string(),
                stage_type: "noop".to_string(),
                depends_on: vec!["clear-scene".to_string()],
                retry: Default::default(),
                budget: Default::default(),
                payload: serde_json::Value::Null,
                optional: false,
            },
        ],
    };

    let mut runner = DagRunner::new(dag, bus).unwrap();
    let client = Arc::new(FixedClient { text: "castle" });
    let handler: Arc<dyn StageHandler> = Arc::new(move |_ctx: HandlerContext| {
        let client = client.clone();
        async move {
            let challenge = adventure_core::agent::Challenge {
                id: "c1".to_string(),
                proposal_type: "asset_placement".to_string(),
                genre: None,
                asset_proposal: None,
                camera_proposal: None,
                context: serde_json::Value::Null,
            };
            let response = client.complete(&challenge).await?;
            Ok(response.data)
        }
    });
    runner.register_stage_handler("clear-scene", handler.clone());
    runner.register_stage_handler("create-batch", handler);

    let results = runner.start(serde_json::json!({})).await.unwrap();
    assert_eq!(results["create-batch"]["layout"], json!("castle"));
}
