//! Story Loop Phase Machine — linear phase FSM driving one narrative cycle
//! (component L). Each phase transitions by returning `{nextPhase, context}`
//! from `enter(context)`; the machine holds at most one current phase and
//! serializes transitions.

use crate::agent::Proposal;
use crate::batch::ProposalBatchManager;
use crate::bus::EventBus;
use crate::judge::{Decision, JudgePanel};
use crate::orchestrator::rpc::{await_any, await_event, bus_request};
use crate::state::StoryState;
use crate::types::{AdventureConfig, AgentId, BatchId, Result};
use crate::voting::{Genre, VoteCollector};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseName {
    GenreSelection,
    Voting,
    AgentCompetition,
    Judging,
    SceneConstruction,
    Presentation,
    Cleanup,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::GenreSelection => "genre-selection",
            PhaseName::Voting => "voting",
            PhaseName::AgentCompetition => "agent-competition",
            PhaseName::Judging => "judging",
            PhaseName::SceneConstruction => "scene-construction",
            PhaseName::Presentation => "presentation",
            PhaseName::Cleanup => "cleanup",
        }
    }
}

pub struct PhaseTransition {
    pub next: PhaseName,
    pub context: serde_json::Value,
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> PhaseName;
    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition>;
    async fn exit(&self) {}
}

/// Handles shared by every phase: the bus, story state, roster, and the
/// coordinators the phases drive (vote collector, batch manager, judge panel).
pub struct PhaseRuntime {
    pub bus: Arc<Mutex<EventBus>>,
    pub state: Arc<Mutex<StoryState>>,
    pub config: AdventureConfig,
    pub agent_ids: Vec<AgentId>,
    pub vote_collector: Arc<VoteCollector>,
    pub batch_manager: Arc<ProposalBatchManager>,
    pub judge_panel: Arc<JudgePanel>,
}

async fn set_path(runtime: &PhaseRuntime, path: &str, value: serde_json::Value) -> Result<()> {
    let mut bus = runtime.bus.lock().await;
    let mut state = runtime.state.lock().await;
    state.set_path(&mut bus, path, value)
}

struct GenreSelectionPhase {
    runtime: Arc<PhaseRuntime>,
}

#[async_trait]
impl Phase for GenreSelectionPhase {
    fn name(&self) -> PhaseName {
        PhaseName::GenreSelection
    }

    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition> {
        let timeout = Duration::from_millis(self.runtime.config.timeouts.llm_request_timeout_ms);
        let result = bus_request(
            &self.runtime.bus,
            "orchestrator:llm:request",
            "orchestrator:llm:result",
            json!({ "purpose": "genre-selection", "count": 5 }),
            timeout,
        )
        .await?;
        let genres: Vec<Genre> = result
            .get("json")
            .and_then(|v| v.get("genres"))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| {
                (1..=5)
                    .map(|i| Genre { id: format!("genre-{i}"), name: format!("Genre {i}") })
                    .collect()
            });

        set_path(&self.runtime, "voting.genres", serde_json::to_value(&genres)?).await?;
        self.runtime.bus.lock().await.emit("loop:genres_ready", json!({ "genres": genres }));

        let mut next_context = context;
        if let Some(obj) = next_context.as_object_mut() {
            obj.insert("genres".to_string(), serde_json::to_value(&genres)?);
        }
        Ok(PhaseTransition { next: PhaseName::Voting, context: next_context })
    }
}

struct VotingPhase {
    runtime: Arc<PhaseRuntime>,
}

#[async_trait]
impl Phase for VotingPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Voting
    }

    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition> {
        let genres: Vec<Genre> = context
            .get("genres")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let close_at = chrono::Utc::now()
            + chrono::Duration::from_std(self.runtime.config.phases.voting_window).unwrap_or_default();
        self.runtime.vote_collector.start_voting(genres, close_at).await;

        let timeout = self.runtime.config.phases.voting_window + Duration::from_secs(5);
        let result = await_any(&self.runtime.bus, "voting:complete", timeout).await;
        let winner = match result {
            Ok(payload) => payload.get("winner").and_then(|v| v.as_str()).map(str::to_string),
            Err(_) => self.runtime.vote_collector.get_winner().await,
        };

        set_path(&self.runtime, "voting.winner", json!(winner)).await?;
        let mut next_context = context;
        if let Some(obj) = next_context.as_object_mut() {
            obj.insert("winningGenre".to_string(), json!(winner));
        }
        Ok(PhaseTransition { next: PhaseName::AgentCompetition, context: next_context })
    }
}

struct AgentCompetitionPhase {
    runtime: Arc<PhaseRuntime>,
}

impl AgentCompetitionPhase {
    async fn run_stage(&self, proposal_type: &str, active: &[AgentId], context: &serde_json::Value) -> Result<Vec<Proposal>> {
        let batch_id = BatchId::new().to_string();
        let deadline = chrono::Utc::now()
            + chrono::Duration::from_std(Duration::from_millis(self.runtime.config.timeouts.proposal_timeout_ms))
                .unwrap_or_default();

        self.runtime.bus.lock().await.emit(
            "proposal:request",
            json!({
                "batchId": batch_id,
                "proposalType": proposal_type,
                "context": context,
                "deadline": deadline.to_rfc3339(),
                "expectedAgents": active,
            }),
        );

        let timeout = Duration::from_millis(self.runtime.config.timeouts.proposal_timeout_ms) + Duration::from_secs(2);
        let result = await_event(&self.runtime.bus, "competition:completed", "batchId", &batch_id, timeout).await?;
        let proposals: Vec<Proposal> = result
            .get("proposals")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Ok(proposals.into_iter().filter(|p| !p.is_failed()).collect())
    }
}

#[async_trait]
impl Phase for AgentCompetitionPhase {
    fn name(&self) -> PhaseName {
        PhaseName::AgentCompetition
    }

    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition> {
        let mut active: Vec<AgentId> = self.runtime.agent_ids.clone();
        let mut combined: HashMap<String, serde_json::Value> = HashMap::new();

        for (field, proposal_type) in [
            ("assetPlacement", "asset_placement"),
            ("cameraPlanning", "camera_move"),
            ("audioNarration", "story_advance"),
        ] {
            if active.is_empty() {
                break;
            }
            let proposals = self.run_stage(proposal_type, &active, &context).await?;
            active = proposals.iter().map(|p| AgentId::from(p.agent_id.clone())).collect();
            for proposal in &proposals {
                let entry = combined.entry(proposal.agent_id.clone()).or_insert_with(|| json!({}));
                if let Some(obj) = entry.as_object_mut() {
                    obj.insert(field.to_string(), serde_json::to_value(proposal)?);
                }
            }
        }

        let complete_proposals: Vec<Proposal> = combined
            .into_iter()
            .map(|(agent_id, joined)| Proposal {
                batch_id: String::new(),
                agent_id,
                proposal_type: "complete".to_string(),
                data: joined,
                reasoning: String::new(),
                summary: None,
                spatial: None,
                timestamp: chrono::Utc::now(),
                tokens_used: 0,
                error: None,
            })
            .collect();

        let mut next_context = context;
        if let Some(obj) = next_context.as_object_mut() {
            obj.insert("completeProposals".to_string(), serde_json::to_value(&complete_proposals)?);
        }
        Ok(PhaseTransition { next: PhaseName::Judging, context: next_context })
    }
}

struct JudgingPhase {
    runtime: Arc<PhaseRuntime>,
}

#[async_trait]
impl Phase for JudgingPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Judging
    }

    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition> {
        let proposals: Vec<Proposal> = context
            .get("completeProposals")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        if proposals.is_empty() {
            self.runtime.bus.lock().await.emit(
                "loop:phase_failed",
                json!({ "phase": self.name().as_str(), "error": "no surviving proposals to judge" }),
            );
            return Ok(PhaseTransition { next: PhaseName::Cleanup, context });
        }

        let batch_id = BatchId::new().to_string();
        let decision: Decision = self.runtime.judge_panel.evaluate_batch(&batch_id, &proposals).await;

        set_path(&self.runtime, "competition.winner", json!(decision.winner)).await?;
        set_path(&self.runtime, "competition.decision", serde_json::to_value(&decision)?).await?;

        let mut next_context = context;
        if let Some(obj) = next_context.as_object_mut() {
            obj.insert("decision".to_string(), serde_json::to_value(&decision)?);
            let winning = decision
                .winner
                .as_ref()
                .and_then(|id| proposals.iter().find(|p| &p.agent_id == id))
                .cloned();
            obj.insert("winningProposal".to_string(), serde_json::to_value(&winning)?);
        }
        Ok(PhaseTransition { next: PhaseName::SceneConstruction, context: next_context })
    }
}

struct SceneConstructionPhase {
    runtime: Arc<PhaseRuntime>,
}

#[async_trait]
impl Phase for SceneConstructionPhase {
    fn name(&self) -> PhaseName {
        PhaseName::SceneConstruction
    }

    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition> {
        let timeout = Duration::from_millis(self.runtime.config.timeouts.mcp_request_timeout_ms);
        let _ = bus_request(
            &self.runtime.bus,
            "orchestrator:mcp:request",
            "orchestrator:mcp:result",
            json!({ "mcpService": "worldbuilder", "command": "clearScene" }),
            timeout,
        )
        .await;

        let batches = context
            .get("winningProposal")
            .and_then(|p| p.get("data"))
            .and_then(|d| d.get("assetPlacement"))
            .and_then(|a| a.get("data"))
            .and_then(|d| d.get("batches"))
            .and_then(|b| b.as_array())
            .cloned()
            .unwrap_or_default();

        for batch in &batches {
            let result = bus_request(
                &self.runtime.bus,
                "orchestrator:mcp:request",
                "orchestrator:mcp:result",
                json!({
                    "mcpService": "worldbuilder",
                    "command": "createBatch",
                    "args": batch,
                }),
                timeout,
            )
            .await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "batch creation failed during scene construction, continuing");
            }
        }

        self.runtime
            .bus
            .lock()
            .await
            .emit("loop:construction_completed", json!({ "batches": batches.len() }));

        Ok(PhaseTransition { next: PhaseName::Presentation, context })
    }
}

struct PresentationPhase {
    runtime: Arc<PhaseRuntime>,
}

#[async_trait]
impl Phase for PresentationPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Presentation
    }

    async fn enter(&self, context: serde_json::Value) -> Result<PhaseTransition> {
        let winning = context.get("winningProposal").cloned().unwrap_or(serde_json::Value::Null);
        let audio_timeout = Duration::from_millis(self.runtime.config.timeouts.audio_request_timeout_ms);

        let audio_payload = match self.runtime.config.phases.audio_mode {
            crate::types::AudioMode::Story => json!({
                "updates": winning.get("data").and_then(|d| d.get("audioNarration")),
                "optional": true,
            }),
            crate::types::AudioMode::Commentary => json!({
                "updates": { "commentary": { "text": winning.get("reasoning") } },
                "optional": true,
            }),
            crate::types::AudioMode::Mixed => json!({
                "updates": winning.get("data").and_then(|d| d.get("audioNarration")),
                "sync": { "id": "presentation", "channels": ["narration", "commentary", "ambient", "music"] },
                "optional": true,
            }),
        };
        let _ = bus_request(
            &self.runtime.bus,
            "orchestrator:audio:request",
            "orchestrator:audio:result",
            audio_payload,
            audio_timeout,
        )
        .await;

        let shots = winning
            .get("data")
            .and_then(|d| d.get("cameraPlanning"))
            .and_then(|c| c.get("data"))
            .and_then(|d| d.get("shots"))
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();

        let mcp_timeout = Duration::from_millis(self.runtime.config.timeouts.mcp_request_timeout_ms);
        let mut total_shot_ms: u64 = 0;
        for shot in &shots {
            let shot_type = shot.get("shotType").and_then(|v| v.as_str()).unwrap_or("smoothMove");
            let tool = match shot_type {
                "arcShot" => "executeArcShot",
                "orbitShot" => "executeOrbitShot",
                _ => "executeSmoothMove",
            };
            total_shot_ms += shot.get("durationMs").and_then(|v| v.as_u64()).unwrap_or(0);
            let _ = bus_request(
                &self.runtime.bus,
                "orchestrator:mcp:request",
                "orchestrator:mcp:result",
                json!({ "mcpService": "worldviewer", "tool": tool, "args": shot }),
                mcp_timeout,
            )
            .await;
        }

        let buffer_ms = self.runtime.config.phases.presentation_buffer_ms;
        let configured_ms = self.runtime.config.phases.presentation_duration.as_millis() as u64;
        let minimum_ms = self.runtime.config.phases.presentation_minimum_wait_ms;
        let wait_ms = (total_shot_ms + buffer_ms).max(configured_ms).max(minimum_ms);
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        Ok(PhaseTransition { next: PhaseName::Cleanup, context })
    }
}

struct CleanupPhase {
    runtime: Arc<PhaseRuntime>,
}

#[async_trait]
impl Phase for CleanupPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Cleanup
    }

    async fn enter(&self, _context: serde_json::Value) -> Result<PhaseTransition> {
        tokio::time::sleep(self.runtime.config.phases.cleanup_countdown).await;

        let timeout = Duration::from_millis(self.runtime.config.timeouts.mcp_request_timeout_ms);
        let _ = bus_request(
            &self.runtime.bus,
            "orchestrator:mcp:request",
            "orchestrator:mcp:result",
            json!({ "mcpService": "worldbuilder", "command": "clearScene" }),
            timeout,
        )
        .await;

        let mut bus = self.runtime.bus.lock().await;
        let mut state = self.runtime.state.lock().await;
        let _ = state.remove_path(&mut bus, "voting");
        let _ = state.remove_path(&mut bus, "competition");
        drop(state);
        drop(bus);

        Ok(PhaseTransition { next: PhaseName::GenreSelection, context: json!({}) })
    }
}

/// Drives the phase sequence one transition at a time, cooperatively
/// stoppable: the current phase always runs to completion, and no further
/// transition is taken once `stop()` has been called.
pub struct PhaseMachine {
    runtime: Arc<PhaseRuntime>,
    phases: HashMap<PhaseName, Arc<dyn Phase>>,
    current: Mutex<PhaseName>,
    stop_flag: Arc<AtomicBool>,
}

impl PhaseMachine {
    pub fn new(runtime: Arc<PhaseRuntime>) -> Self {
        let mut phases: HashMap<PhaseName, Arc<dyn Phase>> = HashMap::new();
        phases.insert(PhaseName::GenreSelection, Arc::new(GenreSelectionPhase { runtime: runtime.clone() }));
        phases.insert(PhaseName::Voting, Arc::new(VotingPhase { runtime: runtime.clone() }));
        phases.insert(PhaseName::AgentCompetition, Arc::new(AgentCompetitionPhase { runtime: runtime.clone() }));
        phases.insert(PhaseName::Judging, Arc::new(JudgingPhase { runtime: runtime.clone() }));
        phases.insert(PhaseName::SceneConstruction, Arc::new(SceneConstructionPhase { runtime: runtime.clone() }));
        phases.insert(PhaseName::Presentation, Arc::new(PresentationPhase { runtime: runtime.clone() }));
        phases.insert(PhaseName::Cleanup, Arc::new(CleanupPhase { runtime: runtime.clone() }));

        Self {
            runtime,
            phases,
            current: Mutex::new(PhaseName::GenreSelection),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn current_phase(&self) -> PhaseName {
        *self.current.lock().await
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Runs exactly one phase transition.
    pub async fn step(&self, context: serde_json::Value) -> Result<serde_json::Value> {
        let name = *self.current.lock().await;
        let phase = self.phases.get(&name).cloned().expect("every PhaseName is registered");

        let transition = match phase.enter(context).await {
            Ok(t) => t,
            Err(err) => {
                self.runtime
                    .bus
                    .lock()
                    .await
                    .emit("loop:phase_failed", json!({ "phase": name.as_str(), "error": err.to_string() }));
                phase.exit().await;
                *self.current.lock().await = PhaseName::Cleanup;
                return Err(err);
            }
        };
        phase.exit().await;
        *self.current.lock().await = transition.next;
        Ok(transition.context)
    }

    /// Drives the full loop until `stop()` is called. The current phase
    /// always finishes before the stop flag is checked.
    pub async fn run(&self) -> Result<()> {
        let mut context = json!({});
        loop {
            context = match self.step(context).await {
                Ok(c) => c,
                Err(_) => json!({}),
            };
            if self.is_stopped() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_round_trip_as_str() {
        assert_eq!(PhaseName::GenreSelection.as_str(), "genre-selection");
        assert_eq!(PhaseName::Cleanup.as_str(), "cleanup");
    }
}
