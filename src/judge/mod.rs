//! Judge Panel — weighted multi-judge evaluation (component F).

use crate::agent::Proposal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn weight(self) -> f64 {
        match self {
            Confidence::High => 3.0,
            Confidence::Medium => 2.0,
            Confidence::Low => 1.0,
        }
    }
}

/// A single judge's verdict over one proposal batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeEvaluation {
    pub judge_id: String,
    pub nominee: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One entry of the panel.
#[derive(Clone)]
pub struct JudgeSpec {
    pub id: String,
    pub specialty: String,
    pub weight: f64,
    pub strictness: f64,
    pub judge: std::sync::Arc<dyn Judge>,
}

/// Capability a judge variant must provide.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, proposals: &[Proposal]) -> crate::types::Result<JudgeEvaluation>;
}

/// Judge backed by an LLM call (trait-object client, mockable).
pub struct LLMJudge {
    pub id: String,
    pub client: std::sync::Arc<dyn crate::agent::ProviderClient>,
}

#[async_trait]
impl Judge for LLMJudge {
    async fn evaluate(&self, proposals: &[Proposal]) -> crate::types::Result<JudgeEvaluation> {
        let challenge = crate::agent::Challenge {
            id: format!("judge-{}", self.id),
            proposal_type: "judging".to_string(),
            genre: None,
            asset_proposal: None,
            camera_proposal: None,
            context: serde_json::json!({ "proposals": proposals }),
        };
        let response = self.client.complete(&challenge).await?;
        let nominee = response
            .data
            .get("nominee")
            .and_then(|v| v.as_str())
            .or_else(|| proposals.first().map(|p| p.agent_id.as_str()))
            .unwrap_or_default()
            .to_string();
        let confidence = response
            .data
            .get("confidence")
            .and_then(|v| v.as_str())
            .map(|s| match s {
                "high" => Confidence::High,
                "low" => Confidence::Low,
                _ => Confidence::Medium,
            })
            .unwrap_or(Confidence::Medium);
        Ok(JudgeEvaluation {
            judge_id: self.id.clone(),
            nominee,
            confidence,
            notes: Some(response.reasoning),
        })
    }
}

/// Deterministic judge driven by a scoring function instead of a vendor call.
/// Useful for specialties that are better expressed as rules than prose
/// (e.g. a "visual" judge scoring spatial bounds overlap).
pub struct RuleBasedJudge {
    pub id: String,
    pub rule: Box<dyn Fn(&[Proposal]) -> (String, Confidence) + Send + Sync>,
}

#[async_trait]
impl Judge for RuleBasedJudge {
    async fn evaluate(&self, proposals: &[Proposal]) -> crate::types::Result<JudgeEvaluation> {
        let (nominee, confidence) = (self.rule)(proposals);
        Ok(JudgeEvaluation {
            judge_id: self.id.clone(),
            nominee,
            confidence,
            notes: None,
        })
    }
}

/// Per-specialty weight, configurable per adventure (`judgeConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub tech: f64,
    pub story: f64,
    pub audience: f64,
    pub visual: f64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self { tech: 1.2, story: 1.0, audience: 1.0, visual: 0.8 }
    }
}

impl JudgeConfig {
    pub fn weight_for(&self, specialty: &str) -> f64 {
        match specialty {
            "tech" => self.tech,
            "story" => self.story,
            "audience" => self.audience,
            "visual" => self.visual,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerJudgeScore {
    pub judge_id: String,
    pub nominee: String,
    pub weight: f64,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub batch_id: String,
    pub winner: Option<String>,
    pub reasoning: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub concerns: Option<String>,
    pub per_judge_scores: Vec<PerJudgeScore>,
}

pub struct JudgePanel {
    judges: Vec<JudgeSpec>,
    config: JudgeConfig,
}

impl JudgePanel {
    pub fn new(judges: Vec<JudgeSpec>, config: Option<JudgeConfig>) -> Self {
        Self { judges, config: config.unwrap_or_default() }
    }

    pub async fn evaluate_batch(&self, batch_id: &str, proposals: &[Proposal]) -> Decision {
        let mut evaluations = Vec::with_capacity(self.judges.len());
        for spec in &self.judges {
            match spec.judge.evaluate(proposals).await {
                Ok(eval) => evaluations.push((spec.clone(), eval, spec.weight)),
                Err(_) => evaluations.push((
                    spec.clone(),
                    JudgeEvaluation {
                        judge_id: spec.id.clone(),
                        nominee: String::new(),
                        confidence: Confidence::Low,
                        notes: Some("judge evaluation failed".to_string()),
                    },
                    0.0,
                )),
            }
        }

        let active: Vec<&(JudgeSpec, JudgeEvaluation, f64)> =
            evaluations.iter().filter(|(_, _, w)| *w > 0.0).collect();

        if active.is_empty() {
            let fallback_nominee = proposals.first().map(|p| p.agent_id.clone());
            return Decision {
                batch_id: batch_id.to_string(),
                winner: fallback_nominee,
                reasoning: "all judges failed to evaluate this batch".to_string(),
                confidence: Confidence::Low,
                concerns: Some("panel unavailable".to_string()),
                per_judge_scores: Vec::new(),
            };
        }

        let mut totals: HashMap<String, f64> = HashMap::new();
        for (_, eval, weight) in &active {
            *totals.entry(eval.nominee.clone()).or_insert(0.0) += *weight;
        }

        let total_weight: f64 = active.iter().map(|(_, _, w)| w).sum();
        let max_total = totals.values().cloned().fold(f64::MIN, f64::max);
        let mut contenders: Vec<&String> = totals
            .iter()
            .filter(|(_, v)| (**v - max_total).abs() < f64::EPSILON)
            .map(|(k, _)| k)
            .collect();
        contenders.sort();

        let avg_confidence = |agent_id: &str| -> f64 {
            let scores: Vec<f64> = active
                .iter()
                .filter(|(_, eval, _)| eval.nominee == agent_id)
                .map(|(_, eval, _)| eval.confidence.weight())
                .collect();
            if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            }
        };

        // `contenders` is sorted ascending by id above, and `max_by` keeps the
        // last element on an Equal comparison, so a confidence tie naturally
        // resolves to the lexicographically later id without a secondary key.
        let winner = contenders
            .iter()
            .max_by(|a, b| avg_confidence(a).partial_cmp(&avg_confidence(b)).unwrap())
            .map(|s| s.to_string());

        let overall_confidence = match winner.as_deref().map(avg_confidence).unwrap_or(0.0) {
            c if c >= 2.5 => Confidence::High,
            c if c >= 1.5 => Confidence::Medium,
            _ => Confidence::Low,
        };

        let winner_weight = winner.as_deref().and_then(|w| totals.get(w)).copied().unwrap_or(0.0);
        let runner_up_weight = totals
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != winner.as_deref())
            .map(|(_, v)| *v)
            .fold(0.0_f64, f64::max);
        let margin = winner_weight - runner_up_weight;

        let judges_in_agreement = active
            .iter()
            .filter(|(_, eval, _)| Some(eval.nominee.as_str()) == winner.as_deref())
            .count();
        let total_judges = active.len();

        let mut concerns = Vec::new();
        if margin <= 0.5 {
            concerns.push("narrow margin of victory".to_string());
        }
        if (judges_in_agreement as f64) < 0.75 * total_judges as f64 {
            concerns.push("low judge agreement".to_string());
        }

        let per_judge_scores = active
            .iter()
            .map(|(spec, eval, weight)| PerJudgeScore {
                judge_id: spec.id.clone(),
                nominee: eval.nominee.clone(),
                weight: *weight,
                confidence: eval.confidence,
            })
            .collect();

        Decision {
            batch_id: batch_id.to_string(),
            winner,
            reasoning: format!(
                "winner determined by weighted vote across {} active judges (total weight {:.2})",
                total_judges, total_weight
            ),
            confidence: overall_confidence,
            concerns: if concerns.is_empty() { None } else { Some(concerns.join("; ")) },
            per_judge_scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn proposal(agent_id: &str) -> Proposal {
        Proposal {
            batch_id: "b1".to_string(),
            agent_id: agent_id.to_string(),
            proposal_type: "scene".to_string(),
            data: serde_json::json!({}),
            reasoning: String::new(),
            summary: None,
            spatial: None,
            timestamp: chrono::Utc::now(),
            tokens_used: 0,
            error: None,
        }
    }

    fn rule_judge(id: &str, nominee: &str, confidence: Confidence) -> JudgeSpec {
        let nominee = nominee.to_string();
        JudgeSpec {
            id: id.to_string(),
            specialty: "tech".to_string(),
            weight: 1.0,
            strictness: 1.0,
            judge: Arc::new(RuleBasedJudge {
                id: id.to_string(),
                rule: Box::new(move |_| (nominee.clone(), confidence)),
            }),
        }
    }

    #[tokio::test]
    async fn majority_weighted_vote_wins() {
        let panel = JudgePanel::new(
            vec![
                rule_judge("j1", "claude", Confidence::High),
                rule_judge("j2", "claude", Confidence::Medium),
                rule_judge("j3", "gpt", Confidence::High),
            ],
            None,
        );
        let decision = panel
            .evaluate_batch("b1", &[proposal("claude"), proposal("gpt")])
            .await;
        assert_eq!(decision.winner.as_deref(), Some("claude"));
    }

    #[tokio::test]
    async fn tie_breaks_by_confidence_then_lexicographic_id() {
        let panel = JudgePanel::new(
            vec![
                JudgeSpec { weight: 1.0, ..rule_judge("j1", "gpt", Confidence::High) },
                JudgeSpec { weight: 1.0, ..rule_judge("j2", "claude", Confidence::High) },
            ],
            None,
        );
        let decision = panel
            .evaluate_batch("b1", &[proposal("claude"), proposal("gpt")])
            .await;
        // Equal weight and confidence: lexicographically later wins per max_by tie tie-break ("gpt" > "claude").
        assert_eq!(decision.winner.as_deref(), Some("gpt"));
    }

    #[tokio::test]
    async fn all_judges_failing_yields_fallback_decision() {
        struct AlwaysFail;
        #[async_trait]
        impl Judge for AlwaysFail {
            async fn evaluate(&self, _proposals: &[Proposal]) -> crate::types::Result<JudgeEvaluation> {
                Err(crate::types::Error::internal("boom"))
            }
        }
        let panel = JudgePanel::new(
            vec![JudgeSpec {
                id: "j1".to_string(),
                specialty: "tech".to_string(),
                weight: 1.0,
                strictness: 1.0,
                judge: Arc::new(AlwaysFail),
            }],
            None,
        );
        let decision = panel.evaluate_batch("b1", &[proposal("claude")]).await;
        assert_eq!(decision.winner.as_deref(), Some("claude"));
        assert_eq!(decision.confidence, Confidence::Low);
        assert_eq!(decision.concerns.as_deref(), Some("panel unavailable"));
    }

    #[tokio::test]
    async fn narrow_margin_flags_concern() {
        let panel = JudgePanel::new(
            vec![
                rule_judge("j1", "claude", Confidence::High),
                rule_judge("j2", "gpt", Confidence::High),
                JudgeSpec { weight: 0.1, ..rule_judge("j3", "claude", Confidence::High) },
            ],
            None,
        );
        let decision = panel
            .evaluate_batch("b1", &[proposal("claude"), proposal("gpt")])
            .await;
        assert!(decision.concerns.is_some());
    }
}
