//! Core types for the adventure orchestration core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (AgentId, BatchId, StageId, …)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Layered configuration for phases, timeouts, caps, and mocks

mod config;
mod errors;
mod ids;

pub use config::{
    AdventureConfig, AudioMode, McpConfig, MockConfig, ObservabilityConfig, PhaseConfig,
    ProviderConfig, ProviderSettings, TimeoutConfig, TokenCapConfig,
};
pub use errors::{Error, Result};
pub use ids::{
    AdventureId, AgentId, BatchId, EventId, GenreId, JudgeId, RequestId, StageId, SubscriptionId,
    UserId,
};
