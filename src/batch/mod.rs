//! Proposal Batch Manager — fan-out/collect over the bus (component E).
//!
//! Protocol: `proposal:request` opens a batch and subscribes for
//! `proposal:submit`; the batch resolves when every expected agent has
//! submitted or its deadline passes, emitting `competition:completed`.

use crate::agent::Proposal;
use crate::bus::{Event, EventBus, SubscribeOptions};
use crate::types::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    Open,
    Complete,
    TimedOut,
    Canceled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub batch_id: String,
    pub proposal_type: String,
    pub context: serde_json::Value,
    pub deadline: DateTime<Utc>,
    pub expected_agents: Vec<AgentId>,
    pub received: Vec<Proposal>,
    pub status: BatchStatus,
    finalized: bool,
}

impl BatchRecord {
    fn has_submitted(&self, agent_id: &str) -> bool {
        self.received.iter().any(|p| p.agent_id == agent_id)
    }
}

#[derive(Debug, Deserialize)]
struct ProposalRequestPayload {
    #[serde(rename = "batchId")]
    batch_id: String,
    #[serde(rename = "proposalType")]
    proposal_type: String,
    #[serde(default)]
    context: serde_json::Value,
    deadline: DateTime<Utc>,
    #[serde(rename = "expectedAgents")]
    expected_agents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProposalSubmitPayload {
    #[serde(rename = "batchId")]
    batch_id: String,
    #[serde(rename = "agentId")]
    agent_id: String,
    proposal: Proposal,
}

#[derive(Debug, Deserialize)]
struct ProposalCancelPayload {
    #[serde(rename = "batchId")]
    batch_id: String,
}

/// Long-lived coordinator: owns no direct API surface beyond subscribing
/// itself to the bus at construction; callers interact purely through events.
pub struct ProposalBatchManager {
    bus: Arc<Mutex<EventBus>>,
    batches: Arc<Mutex<HashMap<String, BatchRecord>>>,
}

impl ProposalBatchManager {
    pub async fn new(bus: Arc<Mutex<EventBus>>) -> Self {
        let batches: Arc<Mutex<HashMap<String, BatchRecord>>> = Arc::new(Mutex::new(HashMap::new()));

        {
            let mut guard = bus.lock().await;

            let req_batches = batches.clone();
            let req_bus = bus.clone();
            guard.subscribe(
                "proposal:request",
                move |event: Event| {
                    let batches = req_batches.clone();
                    let bus = req_bus.clone();
                    async move {
                        let payload: ProposalRequestPayload = serde_json::from_value(event.payload)
                            .map_err(crate::types::Error::Serialization)?;
                        open_batch(&batches, &bus, payload).await;
                        Ok(())
                    }
                },
                SubscribeOptions::default(),
            );

            let sub_batches = batches.clone();
            let sub_bus = bus.clone();
            guard.subscribe(
                "proposal:submit",
                move |event: Event| {
                    let batches = sub_batches.clone();
                    let bus = sub_bus.clone();
                    async move {
                        let payload: ProposalSubmitPayload = serde_json::from_value(event.payload)
                            .map_err(crate::types::Error::Serialization)?;
                        handle_submit(&batches, &bus, payload).await;
                        Ok(())
                    }
                },
                SubscribeOptions::default(),
            );

            let cancel_batches = batches.clone();
            guard.subscribe(
                "proposal:cancel",
                move |event: Event| {
                    let batches = cancel_batches.clone();
                    async move {
                        let payload: ProposalCancelPayload = serde_json::from_value(event.payload)
                            .map_err(crate::types::Error::Serialization)?;
                        let mut guard = batches.lock().await;
                        if let Some(batch) = guard.get_mut(&payload.batch_id) {
                            if !batch.finalized {
                                batch.status = BatchStatus::Canceled;
                                batch.finalized = true;
                            }
                        }
                        Ok(())
                    }
                },
                SubscribeOptions::default(),
            );
        }

        Self { bus, batches }
    }

    pub async fn batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        self.batches.lock().await.get(batch_id).map(|b| b.status)
    }
}

async fn open_batch(
    batches: &Arc<Mutex<HashMap<String, BatchRecord>>>,
    bus: &Arc<Mutex<EventBus>>,
    payload: ProposalRequestPayload,
) {
    let record = BatchRecord {
        batch_id: payload.batch_id.clone(),
        proposal_type: payload.proposal_type,
        context: payload.context,
        deadline: payload.deadline,
        expected_agents: payload.expected_agents.into_iter().map(AgentId::from).collect(),
        received: Vec::new(),
        status: BatchStatus::Open,
        finalized: false,
    };
    batches.lock().await.insert(payload.batch_id.clone(), record);

    let batch_id = payload.batch_id;
    let batches = batches.clone();
    let bus = bus.clone();
    let deadline = payload.deadline;
    tokio::spawn(async move {
        let now = Utc::now();
        if deadline > now {
            let wait = (deadline - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        }
        finalize(&batches, &bus, &batch_id, true).await;
    });
}

async fn handle_submit(
    batches: &Arc<Mutex<HashMap<String, BatchRecord>>>,
    bus: &Arc<Mutex<EventBus>>,
    payload: ProposalSubmitPayload,
) {
    let mut resolved = false;
    {
        let mut guard = batches.lock().await;
        let Some(batch) = guard.get_mut(&payload.batch_id) else {
            drop(guard);
            reject(bus, &payload.batch_id, &payload.agent_id, "unknown batch").await;
            return;
        };
        if batch.status != BatchStatus::Open {
            drop(guard);
            reject(bus, &payload.batch_id, &payload.agent_id, "batch is not open").await;
            return;
        }
        if !batch.expected_agents.iter().any(|a| a.as_str() == payload.agent_id) {
            drop(guard);
            reject(bus, &payload.batch_id, &payload.agent_id, "agent not in expectedAgents").await;
            return;
        }
        if batch.has_submitted(&payload.agent_id) {
            drop(guard);
            reject(bus, &payload.batch_id, &payload.agent_id, "duplicate submission").await;
            return;
        }
        batch.received.push(payload.proposal);
        if batch.received.len() == batch.expected_agents.len() {
            resolved = true;
        }
    }
    if resolved {
        finalize(batches, bus, &payload.batch_id, false).await;
    }
}

async fn reject(bus: &Arc<Mutex<EventBus>>, batch_id: &str, agent_id: &str, reason: &str) {
    bus.lock().await.emit(
        "proposal:rejected",
        serde_json::json!({
            "batchId": batch_id,
            "agentId": agent_id,
            "reason": reason,
        }),
    );
}

async fn finalize(
    batches: &Arc<Mutex<HashMap<String, BatchRecord>>>,
    bus: &Arc<Mutex<EventBus>>,
    batch_id: &str,
    timed_out: bool,
) {
    let snapshot = {
        let mut guard = batches.lock().await;
        let Some(batch) = guard.get_mut(batch_id) else { return };
        if batch.finalized {
            return;
        }
        batch.finalized = true;
        batch.status = if batch.received.is_empty() {
            BatchStatus::Failed
        } else if batch.received.len() == batch.expected_agents.len() {
            BatchStatus::Complete
        } else if timed_out {
            BatchStatus::TimedOut
        } else {
            BatchStatus::Open
        };
        batch.clone()
    };

    let missing: Vec<&str> = snapshot
        .expected_agents
        .iter()
        .map(AgentId::as_str)
        .filter(|id| !snapshot.received.iter().any(|p| &p.agent_id == id))
        .collect();

    bus.lock().await.emit(
        "competition:completed",
        serde_json::json!({
            "batchId": snapshot.batch_id,
            "proposals": snapshot.received,
            "received": snapshot.received.len(),
            "missing": missing,
            "status": snapshot.status,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Proposal as AgentProposal;

    fn proposal(agent_id: &str) -> serde_json::Value {
        serde_json::to_value(AgentProposal {
            batch_id: "b1".to_string(),
            agent_id: agent_id.to_string(),
            proposal_type: "scene".to_string(),
            data: serde_json::json!({}),
            reasoning: "reason".to_string(),
            summary: None,
            spatial: None,
            timestamp: Utc::now(),
            tokens_used: 10,
            error: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn batch_resolves_when_all_expected_submit() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let _manager = ProposalBatchManager::new(bus.clone()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.lock().await.subscribe(
            "competition:completed",
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
            "proposal:request",
            serde_json::json!({
                "batchId": "b1",
                "proposalType": "scene",
                "context": {},
                "deadline": (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339(),
                "expectedAgents": ["claude", "gpt"],
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.lock().await.emit(
            "proposal:submit",
            serde_json::json!({"batchId": "b1", "agentId": "claude", "proposal": proposal("claude")}),
        );
        bus.lock().await.emit(
            "proposal:submit",
            serde_json::json!({"batchId": "b1", "agentId": "gpt", "proposal": proposal("gpt")}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let event = rx.try_recv().expect("competition:completed should have fired");
        assert_eq!(event.payload["status"], serde_json::json!("complete"));
        assert_eq!(event.payload["received"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let _manager = ProposalBatchManager::new(bus.clone()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.lock().await.subscribe(
            "proposal:rejected",
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
            "proposal:request",
            serde_json::json!({
                "batchId": "b1",
                "proposalType": "scene",
                "context": {},
                "deadline": (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339(),
                "expectedAgents": ["claude"],
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.lock().await.emit(
            "proposal:submit",
            serde_json::json!({"batchId": "b1", "agentId": "claude", "proposal": proposal("claude")}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.lock().await.emit(
            "proposal:submit",
            serde_json::json!({"batchId": "b1", "agentId": "claude", "proposal": proposal("claude")}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let rejection = rx.try_recv().expect("duplicate submission should be rejected");
        assert_eq!(rejection.payload["reason"], serde_json::json!("duplicate submission"));
    }

    #[tokio::test]
    async fn deadline_with_zero_proposals_yields_failed_status() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let _manager = ProposalBatchManager::new(bus.clone()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.lock().await.subscribe(
            "competition:completed",
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
            "proposal:request",
            serde_json::json!({
                "batchId": "b2",
                "proposalType": "scene",
                "context": {},
                "deadline": (Utc::now() + chrono::Duration::milliseconds(10)).to_rfc3339(),
                "expectedAgents": ["claude"],
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        let event = rx.try_recv().expect("competition:completed should fire at deadline");
        assert_eq!(event.payload["status"], serde_json::json!("failed"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_prevents_resolution() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let manager = ProposalBatchManager::new(bus.clone()).await;

        bus.lock().await.emit(
            "proposal:request",
            serde_json::json!({
                "batchId": "b3",
                "proposalType": "scene",
                "context": {},
                "deadline": (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339(),
                "expectedAgents": ["claude"],
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.lock().await.emit("proposal:cancel", serde_json::json!({"batchId": "b3"}));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.lock().await.emit("proposal:cancel", serde_json::json!({"batchId": "b3"}));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(manager.batch_status("b3").await, Some(BatchStatus::Canceled));
    }
}
