//! Configuration structures.
//!
//! Configuration is assembled from a literal JSON document, overlaid with
//! environment variables, and validated once at startup. Every nested struct
//! derives `Default` and is `#[serde(default)]` so partial overlays are valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Audio presentation mode, carried as a stable settings key (§6 Persistence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Story,
    Commentary,
    Mixed,
}

impl Default for AudioMode {
    fn default() -> Self {
        AudioMode::Story
    }
}

/// Top-level adventure orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdventureConfig {
    /// Mock-mode flags — bypass real vendor/service calls in tests and demos.
    #[serde(default)]
    pub mocks: MockConfig,

    /// Per-provider LLM settings.
    #[serde(default)]
    pub providers: ProviderConfig,

    /// MCP service base settings.
    #[serde(default)]
    pub mcp: McpConfig,

    /// Story-loop phase durations and budgets.
    #[serde(default)]
    pub phases: PhaseConfig,

    /// Proposal batch and judge-panel timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Per-(agent, provider) token caps.
    #[serde(default)]
    pub token_caps: TokenCapConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Directory DAG config names are resolved against.
    #[serde(default)]
    pub dag_config_dir: Option<String>,

    /// Graceful shutdown timeout for the Orchestrator Manager.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    pub mock_llm: bool,
    pub mock_mcp: bool,
    pub mock_streaming: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            mock_llm: true,
            mock_mcp: true,
            mock_streaming: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Keyed by provider name (`claude`, `gpt`, `gemini`, …).
    #[serde(default)]
    pub models: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub model_id: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// Keyed by service name (`worldbuilder`, `worldviewer`, …).
    #[serde(default)]
    pub services: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(with = "humantime_serde")]
    pub voting_window: Duration,
    #[serde(with = "humantime_serde")]
    pub presentation_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_countdown: Duration,
    pub presentation_buffer_ms: u64,
    pub presentation_minimum_wait_ms: u64,
    pub audio_mode: AudioMode,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            voting_window: Duration::from_secs(30),
            presentation_duration: Duration::from_secs(20),
            cleanup_countdown: Duration::from_secs(5),
            presentation_buffer_ms: 1500,
            presentation_minimum_wait_ms: 5000,
            audio_mode: AudioMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub proposal_timeout_ms: u64,
    pub judge_panel_timeout_ms: u64,
    pub llm_request_timeout_ms: u64,
    pub audio_request_timeout_ms: u64,
    pub mcp_request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            proposal_timeout_ms: 30_000,
            judge_panel_timeout_ms: 15_000,
            llm_request_timeout_ms: 10_000,
            audio_request_timeout_ms: 12_000,
            mcp_request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenCapConfig {
    /// Default cap applied to any (agent, provider) pair without an override.
    pub default_cap: Option<u64>,
    /// Keyed by `"{agent_id}:{provider}"`.
    #[serde(default)]
    pub overrides: HashMap<String, u64>,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// OTLP exporter endpoint (optional).
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

impl AdventureConfig {
    /// Validate cross-field invariants not expressible via `#[serde(default)]`.
    pub fn validate(&self) -> crate::types::Result<()> {
        if self.phases.presentation_minimum_wait_ms == 0 {
            return Err(crate::types::Error::config(
                "phases.presentation_minimum_wait_ms must be positive",
            ));
        }
        if self.timeouts.proposal_timeout_ms == 0 {
            return Err(crate::types::Error::config(
                "timeouts.proposal_timeout_ms must be positive",
            ));
        }
        Ok(())
    }

    /// Resolve the configured cap for a (agent, provider) pair, if any.
    pub fn token_cap_for(&self, agent_id: &str, provider: &str) -> Option<u64> {
        let key = format!("{agent_id}:{provider}");
        self.token_caps
            .overrides
            .get(&key)
            .copied()
            .or(self.token_caps.default_cap)
    }
}
