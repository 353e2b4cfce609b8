//! Token Ledger — per-(agent, provider) usage accounting with caps (component C).
//!
//! Grounded in the same sliding-window-per-key shape as a request rate
//! limiter, but tracking cumulative token/cost usage against a cap instead
//! of a moving time window.

use crate::types::{AgentId, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Usage recorded by a single `generateProposal` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageRecord {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub cost_usd: f64,
}

/// Accumulated usage for one (agentId, provider) pair.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub agent_id: AgentId,
    pub provider: String,
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub cost_usd: f64,
    pub last_reset: DateTime<Utc>,
    pub cap: Option<u64>,
    pub overflow_rejected: u64,
    overflowed: bool,
}

impl LedgerEntry {
    fn new(agent_id: AgentId, provider: String, cap: Option<u64>) -> Self {
        Self {
            agent_id,
            provider,
            prompt: 0,
            completion: 0,
            total: 0,
            cost_usd: 0.0,
            last_reset: Utc::now(),
            cap,
            overflow_rejected: 0,
            overflowed: false,
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.cap.map(|cap| cap.saturating_sub(self.total))
    }
}

/// Per-(agentId, provider) usage accounting with caps and an overflow-rejected counter.
#[derive(Debug, Default)]
pub struct TokenLedger {
    entries: HashMap<(String, String), LedgerEntry>,
    default_cap: Option<u64>,
}

fn key(agent_id: &str, provider: &str) -> (String, String) {
    (agent_id.to_string(), provider.to_string())
}

impl TokenLedger {
    pub fn new(default_cap: Option<u64>) -> Self {
        Self {
            entries: HashMap::new(),
            default_cap,
        }
    }

    fn entry_mut(&mut self, agent_id: &AgentId, provider: &str) -> &mut LedgerEntry {
        self.entries
            .entry(key(agent_id.as_str(), provider))
            .or_insert_with(|| LedgerEntry::new(agent_id.clone(), provider.to_string(), self.default_cap))
    }

    /// Set (or clear) the cap for a specific (agentId, provider) pair, overriding
    /// the ledger's default cap for that pair only.
    pub fn set_cap(&mut self, agent_id: &AgentId, provider: &str, cap: Option<u64>) {
        self.entry_mut(agent_id, provider).cap = cap;
    }

    /// Must be called before issuing a generation call: fails with
    /// `TokenCapExceeded` if a prior `record` already pushed this pair over
    /// its cap.
    pub fn check_cap(&mut self, agent_id: &AgentId, provider: &str) -> Result<()> {
        let entry = self.entry_mut(agent_id, provider);
        if entry.overflowed {
            entry.overflow_rejected += 1;
            return Err(Error::token_cap_exceeded(agent_id.as_str(), provider));
        }
        Ok(())
    }

    /// Record usage for a completed call. Always succeeds and accumulates;
    /// if this record pushes total usage past the cap, the ledger flags the
    /// pair so the *next* `check_cap` call rejects — this call itself is not
    /// rejected.
    pub fn record(&mut self, agent_id: &AgentId, provider: &str, usage: UsageRecord) {
        let entry = self.entry_mut(agent_id, provider);
        entry.prompt += usage.prompt;
        entry.completion += usage.completion;
        entry.total += usage.total;
        entry.cost_usd += usage.cost_usd;
        if let Some(cap) = entry.cap {
            if entry.total > cap {
                entry.overflowed = true;
            }
        }
    }

    pub fn remaining(&self, agent_id: &AgentId, provider: &str) -> Option<u64> {
        self.entries
            .get(&key(agent_id.as_str(), provider))
            .and_then(LedgerEntry::remaining)
    }

    /// Reset usage for a single pair (`Some`) or the whole ledger (`None`).
    pub fn reset(&mut self, scope: Option<(&AgentId, &str)>) {
        match scope {
            Some((agent_id, provider)) => {
                if let Some(entry) = self.entries.get_mut(&key(agent_id.as_str(), provider)) {
                    let cap = entry.cap;
                    *entry = LedgerEntry::new(agent_id.clone(), provider.to_string(), cap);
                }
            }
            None => {
                for entry in self.entries.values_mut() {
                    let cap = entry.cap;
                    *entry = LedgerEntry::new(entry.agent_id.clone(), entry.provider.clone(), cap);
                }
            }
        }
    }

    /// Structured usage report across every tracked (agentId, provider) pair.
    pub fn report(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .entries
            .values()
            .map(|e| {
                serde_json::json!({
                    "agentId": e.agent_id.as_str(),
                    "provider": e.provider,
                    "prompt": e.prompt,
                    "completion": e.completion,
                    "total": e.total,
                    "costUSD": e.cost_usd,
                    "cap": e.cap,
                    "remaining": e.remaining(),
                    "overflowRejected": e.overflow_rejected,
                })
            })
            .collect();
        serde_json::json!({ "entries": entries })
    }
}
