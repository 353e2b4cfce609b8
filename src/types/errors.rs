//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the adventure orchestration core.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (malformed input, invalid state transition requested).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (unknown subscription, stage, batch, adventure).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid DAG: duplicate stage ids, dangling dependency, or a cycle.
    /// Fatal at load time; never retried.
    #[error("config error: {0}")]
    Config(String),

    /// A stage was scheduled but no handler is registered for its type or id.
    /// Fatal to the DAG run.
    #[error("no handler registered for stage {stage_id} (type {stage_type})")]
    HandlerMissing { stage_id: String, stage_type: String },

    /// A DAG stage's handler did not complete within its budget.
    #[error("stage {stage_id} exceeded its time budget of {budget_ms}ms")]
    StageTimeout { stage_id: String, budget_ms: u64 },

    /// A bus-mediated request/response round trip did not resolve in time.
    #[error("request {request_id} for event {awaited_event} timed out")]
    RequestTimeout {
        request_id: String,
        awaited_event: String,
    },

    /// Vendor API rejection (rate limit, overload, schema mismatch).
    #[error("provider error ({provider}): {message}")]
    ProviderError { provider: String, message: String },

    /// The token ledger refuses further calls for this (agent, provider) pair.
    /// Permanent within the current ledger window; never retried.
    #[error("token cap exceeded for agent {agent_id} / provider {provider}")]
    TokenCapExceeded { agent_id: String, provider: String },

    /// A proposal batch resolved with fewer submissions than expected.
    #[error("batch {batch_id} incomplete: received {received}/{expected}")]
    BatchIncomplete {
        batch_id: String,
        received: usize,
        expected: usize,
    },

    /// An MCP service call failed.
    #[error("mcp error ({service}): {message}")]
    MCPError { service: String, message: String },

    /// The audio service is offline and the requesting stage was not optional.
    #[error("audio service offline")]
    AudioOffline,

    /// Quota or resource exhaustion outside the token ledger (e.g. rate limiting).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid state transition (phase machine, DAG runner, vote collector).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors — should not normally surface to callers.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation (subscription cancelled, adventure shut down mid-flight).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Generic timeout not covered by a more specific variant above.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (config file loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors, mirroring the call sites' dominant error shapes.
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn handler_missing(stage_id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        Self::HandlerMissing {
            stage_id: stage_id.into(),
            stage_type: stage_type.into(),
        }
    }

    pub fn stage_timeout(stage_id: impl Into<String>, budget_ms: u64) -> Self {
        Self::StageTimeout {
            stage_id: stage_id.into(),
            budget_ms,
        }
    }

    pub fn request_timeout(request_id: impl Into<String>, awaited_event: impl Into<String>) -> Self {
        Self::RequestTimeout {
            request_id: request_id.into(),
            awaited_event: awaited_event.into(),
        }
    }

    pub fn provider_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn token_cap_exceeded(agent_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::TokenCapExceeded {
            agent_id: agent_id.into(),
            provider: provider.into(),
        }
    }

    pub fn batch_incomplete(batch_id: impl Into<String>, received: usize, expected: usize) -> Self {
        Self::BatchIncomplete {
            batch_id: batch_id.into(),
            received,
            expected,
        }
    }

    pub fn mcp_error(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MCPError {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether this error is retryable per a DAG stage's own retry policy.
    /// Config/HandlerMissing/TokenCapExceeded are never retried regardless of policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Config(_) | Error::HandlerMissing { .. } | Error::TokenCapExceeded { .. }
        )
    }
}
