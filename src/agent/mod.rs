//! Agent Abstraction — capability-typed proposal producers (component D).
//!
//! Agents are polymorphic over a small capability set rather than a class
//! hierarchy: the `Agent` trait is the capability surface, and concrete
//! behavior (single-provider, multi-provider failover at the batch layer,
//! or a deterministic mock for tests) lives in the three variants below.

use crate::ledger::{TokenLedger, UsageRecord};
use crate::types::{AgentId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Challenge handed to an agent to produce a proposal for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    #[serde(rename = "type")]
    pub proposal_type: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default, rename = "assetProposal")]
    pub asset_proposal: Option<serde_json::Value>,
    #[serde(default, rename = "cameraProposal")]
    pub camera_proposal: Option<serde_json::Value>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// An agent's structured answer to a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(rename = "batchId")]
    pub batch_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "proposalType")]
    pub proposal_type: String,
    pub data: serde_json::Value,
    pub reasoning: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub spatial: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl Proposal {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Health snapshot returned by `getHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Inactive,
    Active,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub proposals_generated: u64,
    pub proposals_failed: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: AgentStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub metrics: AgentMetrics,
}

/// Minimal abstraction over a vendor LLM call, so `SingleLLMAgent` and
/// `MultiLLMAgent` are mockable without a live network dependency.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(&self, challenge: &Challenge) -> Result<ProviderResponse>;
}

pub struct ProviderResponse {
    pub data: serde_json::Value,
    pub reasoning: String,
    pub summary: Option<String>,
    pub spatial: Option<serde_json::Value>,
    pub usage: UsageRecord,
}

/// Capability set every agent variant must provide.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &AgentId;

    async fn initialize(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn get_health(&self) -> Health;
    async fn generate_proposal(&self, batch_id: &str, challenge: &Challenge) -> Result<Proposal>;
}

#[derive(Debug, Default)]
struct Runtime {
    status: AgentStatus,
    last_error: Option<String>,
    metrics: AgentMetrics,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Inactive
    }
}

fn failed_proposal(batch_id: &str, agent_id: &str, proposal_type: &str, message: String) -> Proposal {
    Proposal {
        batch_id: batch_id.to_string(),
        agent_id: agent_id.to_string(),
        proposal_type: proposal_type.to_string(),
        data: serde_json::Value::Null,
        reasoning: String::new(),
        summary: None,
        spatial: None,
        timestamp: Utc::now(),
        tokens_used: 0,
        error: Some(message),
    }
}

/// An agent bound to exactly one LLM provider at construction.
/// Failover across providers is handled at the batch layer, not here.
pub struct SingleLLMAgent {
    id: AgentId,
    provider: String,
    client: Arc<dyn ProviderClient>,
    ledger: Arc<Mutex<TokenLedger>>,
    runtime: Mutex<Runtime>,
}

impl SingleLLMAgent {
    pub fn new(
        id: AgentId,
        provider: impl Into<String>,
        client: Arc<dyn ProviderClient>,
        ledger: Arc<Mutex<TokenLedger>>,
    ) -> Self {
        Self {
            id,
            provider: provider.into(),
            client,
            ledger,
            runtime: Mutex::new(Runtime::default()),
        }
    }
}

#[async_trait]
impl Agent for SingleLLMAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.runtime.lock().await.status = AgentStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.lock().await.status = AgentStatus::Inactive;
        Ok(())
    }

    async fn get_health(&self) -> Health {
        let runtime = self.runtime.lock().await;
        Health {
            status: runtime.status,
            last_error: runtime.last_error.clone(),
            metrics: runtime.metrics.clone(),
        }
    }

    async fn generate_proposal(&self, batch_id: &str, challenge: &Challenge) -> Result<Proposal> {
        {
            let mut ledger = self.ledger.lock().await;
            ledger.check_cap(&self.id, &self.provider)?;
        }

        match self.client.complete(challenge).await {
            Ok(response) => {
                self.ledger
                    .lock()
                    .await
                    .record(&self.id, &self.provider, response.usage);
                let mut runtime = self.runtime.lock().await;
                runtime.metrics.proposals_generated += 1;
                runtime.metrics.total_tokens += response.usage.total;
                Ok(Proposal {
                    batch_id: batch_id.to_string(),
                    agent_id: self.id.to_string(),
                    proposal_type: challenge.proposal_type.clone(),
                    data: response.data,
                    reasoning: response.reasoning,
                    summary: response.summary,
                    spatial: response.spatial,
                    timestamp: Utc::now(),
                    tokens_used: response.usage.total,
                    error: None,
                })
            }
            Err(err) => {
                if let crate::types::Error::TokenCapExceeded { .. } = err {
                    return Err(err);
                }
                let mut runtime = self.runtime.lock().await;
                runtime.metrics.proposals_failed += 1;
                runtime.last_error = Some(err.to_string());
                runtime.status = AgentStatus::Error;
                Ok(failed_proposal(
                    batch_id,
                    self.id.as_str(),
                    &challenge.proposal_type,
                    err.to_string(),
                ))
            }
        }
    }
}

/// One named client per provider; the agent always dispatches to its
/// currently-selected provider. Switching providers is an explicit call,
/// not automatic failover.
pub struct MultiLLMAgent {
    id: AgentId,
    clients: Vec<(String, Arc<dyn ProviderClient>)>,
    active_provider: Mutex<usize>,
    ledger: Arc<Mutex<TokenLedger>>,
    runtime: Mutex<Runtime>,
}

impl MultiLLMAgent {
    pub fn new(
        id: AgentId,
        clients: Vec<(String, Arc<dyn ProviderClient>)>,
        ledger: Arc<Mutex<TokenLedger>>,
    ) -> Self {
        assert!(!clients.is_empty(), "MultiLLMAgent requires at least one provider");
        Self {
            id,
            clients,
            active_provider: Mutex::new(0),
            ledger,
            runtime: Mutex::new(Runtime::default()),
        }
    }

    /// Switches the currently active provider. Returns `false` if `provider`
    /// is not among this agent's configured clients.
    pub async fn select_provider(&self, provider: &str) -> bool {
        if let Some(idx) = self.clients.iter().position(|(p, _)| p == provider) {
            *self.active_provider.lock().await = idx;
            true
        } else {
            false
        }
    }

    async fn active(&self) -> (String, Arc<dyn ProviderClient>) {
        let idx = *self.active_provider.lock().await;
        let (provider, client) = &self.clients[idx];
        (provider.clone(), client.clone())
    }
}

#[async_trait]
impl Agent for MultiLLMAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.runtime.lock().await.status = AgentStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.lock().await.status = AgentStatus::Inactive;
        Ok(())
    }

    async fn get_health(&self) -> Health {
        let runtime = self.runtime.lock().await;
        Health {
            status: runtime.status,
            last_error: runtime.last_error.clone(),
            metrics: runtime.metrics.clone(),
        }
    }

    async fn generate_proposal(&self, batch_id: &str, challenge: &Challenge) -> Result<Proposal> {
        let (provider, client) = self.active().await;
        {
            let mut ledger = self.ledger.lock().await;
            ledger.check_cap(&self.id, &provider)?;
        }

        match client.complete(challenge).await {
            Ok(response) => {
                self.ledger.lock().await.record(&self.id, &provider, response.usage);
                let mut runtime = self.runtime.lock().await;
                runtime.metrics.proposals_generated += 1;
                runtime.metrics.total_tokens += response.usage.total;
                Ok(Proposal {
                    batch_id: batch_id.to_string(),
                    agent_id: self.id.to_string(),
                    proposal_type: challenge.proposal_type.clone(),
                    data: response.data,
                    reasoning: response.reasoning,
                    summary: response.summary,
                    spatial: response.spatial,
                    timestamp: Utc::now(),
                    tokens_used: response.usage.total,
                    error: None,
                })
            }
            Err(err) => {
                if let crate::types::Error::TokenCapExceeded { .. } = err {
                    return Err(err);
                }
                let mut runtime = self.runtime.lock().await;
                runtime.metrics.proposals_failed += 1;
                runtime.last_error = Some(err.to_string());
                runtime.status = AgentStatus::Error;
                Ok(failed_proposal(
                    batch_id,
                    self.id.as_str(),
                    &challenge.proposal_type,
                    err.to_string(),
                ))
            }
        }
    }
}

/// Deterministic agent for tests: returns a scripted response or a scripted
/// failure without touching a ledger or any network client.
pub struct MockAgent {
    id: AgentId,
    scripted: Mutex<std::collections::VecDeque<Result<ProviderResponse>>>,
    runtime: Mutex<Runtime>,
}

impl MockAgent {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            scripted: Mutex::new(std::collections::VecDeque::new()),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub async fn push_response(&self, response: ProviderResponse) {
        self.scripted.lock().await.push_back(Ok(response));
    }

    pub async fn push_error(&self, err: crate::types::Error) {
        self.scripted.lock().await.push_back(Err(err));
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.runtime.lock().await.status = AgentStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.lock().await.status = AgentStatus::Inactive;
        Ok(())
    }

    async fn get_health(&self) -> Health {
        let runtime = self.runtime.lock().await;
        Health {
            status: runtime.status,
            last_error: runtime.last_error.clone(),
            metrics: runtime.metrics.clone(),
        }
    }

    async fn generate_proposal(&self, batch_id: &str, challenge: &Challenge) -> Result<Proposal> {
        let next = self.scripted.lock().await.pop_front();
        match next {
            Some(Ok(response)) => {
                let mut runtime = self.runtime.lock().await;
                runtime.metrics.proposals_generated += 1;
                Ok(Proposal {
                    batch_id: batch_id.to_string(),
                    agent_id: self.id.to_string(),
                    proposal_type: challenge.proposal_type.clone(),
                    data: response.data,
                    reasoning: response.reasoning,
                    summary: response.summary,
                    spatial: response.spatial,
                    timestamp: Utc::now(),
                    tokens_used: response.usage.total,
                    error: None,
                })
            }
            Some(Err(err)) => {
                if let crate::types::Error::TokenCapExceeded { .. } = err {
                    return Err(err);
                }
                Ok(failed_proposal(batch_id, self.id.as_str(), &challenge.proposal_type, err.to_string()))
            }
            None => Ok(failed_proposal(
                batch_id,
                self.id.as_str(),
                &challenge.proposal_type,
                "mock agent has no scripted response queued".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge() -> Challenge {
        Challenge {
            id: "c1".to_string(),
            proposal_type: "scene".to_string(),
            genre: Some("cyberpunk".to_string()),
            asset_proposal: None,
            camera_proposal: None,
            context: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn mock_agent_returns_scripted_response() {
        let agent = MockAgent::new(AgentId::from("mock1"));
        agent
            .push_response(ProviderResponse {
                data: serde_json::json!({"ok": true}),
                reasoning: "because".to_string(),
                summary: None,
                spatial: None,
                usage: UsageRecord { total: 42, ..Default::default() },
            })
            .await;
        let proposal = agent.generate_proposal("batch1", &challenge()).await.unwrap();
        assert!(!proposal.is_failed());
        assert_eq!(proposal.tokens_used, 42);
    }

    #[tokio::test]
    async fn mock_agent_returns_failed_proposal_not_exception() {
        let agent = MockAgent::new(AgentId::from("mock1"));
        agent.push_error(crate::types::Error::provider_error("anthropic", "overloaded")).await;
        let proposal = agent.generate_proposal("batch1", &challenge()).await.unwrap();
        assert!(proposal.is_failed());
    }

    #[tokio::test]
    async fn mock_agent_propagates_token_cap_exceeded() {
        let agent = MockAgent::new(AgentId::from("mock1"));
        agent
            .push_error(crate::types::Error::token_cap_exceeded("mock1", "anthropic"))
            .await;
        let err = agent.generate_proposal("batch1", &challenge()).await;
        assert!(matches!(err, Err(crate::types::Error::TokenCapExceeded { .. })));
    }

    struct AlwaysFailClient;

    #[async_trait]
    impl ProviderClient for AlwaysFailClient {
        async fn complete(&self, _challenge: &Challenge) -> Result<ProviderResponse> {
            Err(crate::types::Error::provider_error("anthropic", "503"))
        }
    }

    #[tokio::test]
    async fn single_llm_agent_checks_cap_before_calling_provider() {
        let ledger = Arc::new(Mutex::new(TokenLedger::new(Some(0))));
        ledger
            .lock()
            .await
            .record(&AgentId::from("claude"), "anthropic", UsageRecord { total: 1, ..Default::default() });
        let agent = SingleLLMAgent::new(
            AgentId::from("claude"),
            "anthropic",
            Arc::new(AlwaysFailClient),
            ledger,
        );
        let err = agent.generate_proposal("batch1", &challenge()).await;
        assert!(matches!(err, Err(crate::types::Error::TokenCapExceeded { .. })));
    }

    #[tokio::test]
    async fn single_llm_agent_wraps_provider_error_as_failed_proposal() {
        let ledger = Arc::new(Mutex::new(TokenLedger::new(None)));
        let agent = SingleLLMAgent::new(
            AgentId::from("claude"),
            "anthropic",
            Arc::new(AlwaysFailClient),
            ledger,
        );
        let proposal = agent.generate_proposal("batch1", &challenge()).await.unwrap();
        assert!(proposal.is_failed());
    }

    #[tokio::test]
    async fn multi_llm_agent_select_provider_switches_active_client() {
        let ledger = Arc::new(Mutex::new(TokenLedger::new(None)));
        let agent = MultiLLMAgent::new(
            AgentId::from("gpt"),
            vec![
                ("openai".to_string(), Arc::new(AlwaysFailClient) as Arc<dyn ProviderClient>),
                ("azure".to_string(), Arc::new(AlwaysFailClient) as Arc<dyn ProviderClient>),
            ],
            ledger,
        );
        assert!(agent.select_provider("azure").await);
        assert!(!agent.select_provider("nonexistent").await);
    }
}
