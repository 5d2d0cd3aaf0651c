//! Task analysis and agent selection.
//!
//! The [`Planner`] trait is the seam for an external (LLM-backed)
//! translator from natural language to execution plans. The core ships
//! [`StubPlanner`], which works purely from the registry's category, tag,
//! and capability indices — no model calls anywhere.
//!
//! Agent scoring is deterministic and lives here so both the stub and the
//! orchestrator's confidence gate share one implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::SwarmError;
use crate::plan::{ExecutionPlan, Step};
use crate::registry::{AgentDescriptor, AgentFilter, SharedRegistry};

// ─── Requirements ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// What the analyzer derived from a task description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequirements {
    /// Domain tag matched against agent categories.
    pub domain: String,
    /// Ordered actions; the plan emits one step per action.
    pub actions: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub complexity: Complexity,
    pub estimated_steps: usize,
    /// Free tags matched against agent tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

// ─── Recommendations ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationBucket {
    Primary,
    Secondary,
    Optional,
}

/// One scored agent candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecommendation {
    pub agent_id: String,
    /// Normalized to [0, 1].
    pub score: f64,
    pub bucket: RecommendationBucket,
    pub matched_capabilities: Vec<String>,
}

/// Candidates below this normalized score are discarded outright.
const SCORE_FLOOR: f64 = 0.3;
const PRIMARY_THRESHOLD: f64 = 0.7;
const SECONDARY_THRESHOLD: f64 = 0.5;

/// Score every enabled agent against the requirements.
///
/// Raw score: `+0.5` on category/domain match, `+0.3` per required
/// capability the agent covers (capped at `0.3 × |required|`), `+0.1` per
/// shared tag. Normalized by the maximum score possible for these
/// requirements; agents under 0.3 are dropped. Deterministic: ties keep
/// registry order (sorted by agent id upstream).
pub fn score_agents(
    requirements: &TaskRequirements,
    available: &[AgentDescriptor],
) -> Vec<AgentRecommendation> {
    let required = &requirements.required_capabilities;
    let max_score = 0.5 + 0.3 * required.len() as f64 + 0.1 * requirements.tags.len() as f64;

    let mut out = Vec::new();
    for agent in available.iter().filter(|a| a.enabled) {
        let mut score = 0.0_f64;
        if agent.category.as_deref() == Some(requirements.domain.as_str()) {
            score += 0.5;
        }

        let matched: Vec<String> = required
            .iter()
            .filter(|cap| agent.capability_names().any(|n| n == cap.as_str()))
            .cloned()
            .collect();
        score += (0.3 * matched.len() as f64).min(0.3 * required.len() as f64);

        let tag_hits = requirements
            .tags
            .iter()
            .filter(|t| agent.tags.iter().any(|x| x == *t))
            .count();
        score += 0.1 * tag_hits as f64;

        let normalized = if max_score > 0.0 { score / max_score } else { 0.0 };
        if normalized < SCORE_FLOOR {
            continue;
        }
        let bucket = if normalized >= PRIMARY_THRESHOLD {
            RecommendationBucket::Primary
        } else if normalized >= SECONDARY_THRESHOLD {
            RecommendationBucket::Secondary
        } else {
            RecommendationBucket::Optional
        };
        out.push(AgentRecommendation {
            agent_id: agent.agent_id.clone(),
            score: normalized,
            bucket,
            matched_capabilities: matched,
        });
    }
    // Highest score first; id breaks ties so the order is stable.
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
    out
}

/// Plan confidence: mean score of the primary bucket, 0 with no primaries.
pub fn plan_confidence(recommendations: &[AgentRecommendation]) -> f64 {
    let primaries: Vec<f64> = recommendations
        .iter()
        .filter(|r| r.bucket == RecommendationBucket::Primary)
        .map(|r| r.score)
        .collect();
    if primaries.is_empty() {
        return 0.0;
    }
    primaries.iter().sum::<f64>() / primaries.len() as f64
}

// ─── Plan construction ────────────────────────────────────────────────────────

/// Emit one step per required action, chained in the analyzer's order.
///
/// Each action is assigned the best-scoring agent that exposes a matching
/// capability; actions nobody covers are an `Invalid` error (the caller
/// surfaces it before any task exists).
pub fn build_plan(
    requirements: &TaskRequirements,
    recommendations: &[AgentRecommendation],
    available: &[AgentDescriptor],
    context: Map<String, Value>,
) -> Result<ExecutionPlan, SwarmError> {
    let mut steps: Vec<Step> = Vec::with_capacity(requirements.actions.len());
    let mut previous: Option<String> = None;

    for (i, action) in requirements.actions.iter().enumerate() {
        let agent = recommendations
            .iter()
            .filter_map(|r| available.iter().find(|a| a.agent_id == r.agent_id))
            .find(|a| a.capability_names().any(|n| n == action.as_str()))
            .ok_or_else(|| {
                SwarmError::invalid(format!("no selected agent covers action {action:?}"))
            })?;

        let step_id = format!("s{}", i + 1);
        let mut step = Step::new(step_id.clone(), agent.agent_id.clone(), action.clone());
        step.name = format!("{action} via {}", agent.agent_id);
        step.input = json!({ "description": requirements.domain, "action": action });
        if let Some(prev) = previous.take() {
            step.dependencies.push(prev);
        }
        previous = Some(step_id);
        steps.push(step);
    }

    ExecutionPlan::new(uuid::Uuid::new_v4().to_string(), steps, context)
}

// ─── Planner seam ─────────────────────────────────────────────────────────────

/// External planner collaborator (LLM-backed in production deployments).
#[async_trait]
pub trait Planner: Send + Sync {
    async fn analyze(&self, description: &str) -> Result<TaskRequirements, SwarmError>;

    async fn select_agents(
        &self,
        requirements: &TaskRequirements,
        available: &[AgentDescriptor],
    ) -> Result<Vec<AgentRecommendation>, SwarmError>;

    /// Full NL → plan path; the default composes analyze + select + build.
    async fn create_plan(
        &self,
        description: &str,
        available: &[AgentDescriptor],
    ) -> Result<ExecutionPlan, SwarmError> {
        let requirements = self.analyze(description).await?;
        let recommendations = self.select_agents(&requirements, available).await?;
        build_plan(&requirements, &recommendations, available, Map::new())
    }
}

// ─── Stub planner ─────────────────────────────────────────────────────────────

/// Registry-driven planner: matches description words against the
/// category/tag/capability indices. Good enough to exercise the whole
/// pipeline without a model.
pub struct StubPlanner {
    registry: SharedRegistry,
}

impl StubPlanner {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    fn words(description: &str) -> Vec<String> {
        description
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_ascii_lowercase())
            .collect()
    }
}

#[async_trait]
impl Planner for StubPlanner {
    async fn analyze(&self, description: &str) -> Result<TaskRequirements, SwarmError> {
        let words = Self::words(description);
        let agents = self.registry.list(&AgentFilter::default()).await;

        let mut domain = String::from("general");
        let mut capabilities: Vec<String> = Vec::new();
        let mut tags: Vec<String> = Vec::new();

        for agent in &agents {
            if let Some(cat) = &agent.category {
                if domain == "general" && words.iter().any(|w| w == &cat.to_ascii_lowercase()) {
                    domain = cat.clone();
                }
            }
            for cap in agent.capability_names() {
                let lc = cap.to_ascii_lowercase();
                if words.iter().any(|w| w == &lc) && !capabilities.iter().any(|c| c == cap) {
                    capabilities.push(cap.to_string());
                }
            }
            for tag in &agent.tags {
                let lc = tag.to_ascii_lowercase();
                if words.iter().any(|w| w == &lc) && !tags.iter().any(|t| t == tag) {
                    tags.push(tag.clone());
                }
            }
        }
        if capabilities.is_empty() {
            // Nothing recognizable — fall back to a single chat step.
            capabilities.push("chat".to_string());
        }

        let actions = capabilities.clone();
        let complexity = match actions.len() {
            0 | 1 => Complexity::Simple,
            2 | 3 => Complexity::Moderate,
            _ => Complexity::Complex,
        };
        Ok(TaskRequirements {
            domain,
            estimated_steps: actions.len(),
            actions,
            required_capabilities: capabilities,
            complexity,
            tags,
        })
    }

    async fn select_agents(
        &self,
        requirements: &TaskRequirements,
        available: &[AgentDescriptor],
    ) -> Result<Vec<AgentRecommendation>, SwarmError> {
        Ok(score_agents(requirements, available))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capability, CapabilityKind};

    fn agent(id: &str, category: Option<&str>, tags: &[&str], caps: &[&str]) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: id.to_string(),
            name: id.to_string(),
            version: String::new(),
            category: category.map(|c| c.to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            capabilities: caps
                .iter()
                .map(|c| Capability {
                    name: c.to_string(),
                    kind: CapabilityKind::from(*c),
                    description: String::new(),
                    input_schema: Value::Null,
                    output_schema: Value::Null,
                })
                .collect(),
            enabled: true,
        }
    }

    fn req(domain: &str, caps: &[&str], tags: &[&str]) -> TaskRequirements {
        TaskRequirements {
            domain: domain.to_string(),
            actions: caps.iter().map(|c| c.to_string()).collect(),
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            complexity: Complexity::Simple,
            estimated_steps: caps.len(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn perfect_match_is_primary_with_score_one() {
        let agents = vec![agent("a", Some("scraping"), &["web"], &["scrape"])];
        let recs = score_agents(&req("scraping", &["scrape"], &["web"]), &agents);
        assert_eq!(recs.len(), 1);
        assert!((recs[0].score - 1.0).abs() < 1e-9);
        assert_eq!(recs[0].bucket, RecommendationBucket::Primary);
    }

    #[test]
    fn below_floor_is_discarded_and_disabled_skipped() {
        let mut off = agent("off", Some("scraping"), &[], &["scrape"]);
        off.enabled = false;
        let stranger = agent("stranger", Some("email"), &[], &["send"]);
        let recs = score_agents(&req("scraping", &["scrape"], &[]), &[off, stranger]);
        assert!(recs.is_empty());
    }

    #[test]
    fn buckets_split_on_thresholds() {
        // Category only: 0.5 / 0.9 ≈ 0.56 → secondary.
        let partial = agent("partial", Some("scraping"), &[], &["other"]);
        // Category + capability: 0.8 / 0.9 ≈ 0.89 → primary.
        let full = agent("full", Some("scraping"), &[], &["scrape"]);
        let recs = score_agents(&req("scraping", &["scrape"], &["web"]), &[partial, full]);
        assert_eq!(recs[0].agent_id, "full");
        assert_eq!(recs[0].bucket, RecommendationBucket::Primary);
        assert_eq!(recs[1].agent_id, "partial");
        assert_eq!(recs[1].bucket, RecommendationBucket::Secondary);
    }

    #[test]
    fn confidence_is_mean_of_primaries() {
        let recs = vec![
            AgentRecommendation {
                agent_id: "a".into(),
                score: 0.9,
                bucket: RecommendationBucket::Primary,
                matched_capabilities: vec![],
            },
            AgentRecommendation {
                agent_id: "b".into(),
                score: 0.7,
                bucket: RecommendationBucket::Primary,
                matched_capabilities: vec![],
            },
            AgentRecommendation {
                agent_id: "c".into(),
                score: 0.6,
                bucket: RecommendationBucket::Secondary,
                matched_capabilities: vec![],
            },
        ];
        assert!((plan_confidence(&recs) - 0.8).abs() < 1e-9);
        assert_eq!(plan_confidence(&[]), 0.0);
    }

    #[test]
    fn build_plan_chains_actions_in_order() {
        let agents = vec![
            agent("scraper", Some("scraping"), &[], &["scrape"]),
            agent("writer", Some("scraping"), &[], &["generate"]),
        ];
        let requirements = req("scraping", &["scrape", "generate"], &[]);
        let recs = score_agents(&requirements, &agents);
        let plan = build_plan(&requirements, &recs, &agents, Map::new()).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].agent_id, "scraper");
        assert_eq!(plan.steps[1].agent_id, "writer");
        assert_eq!(plan.steps[1].dependencies, vec!["s1".to_string()]);
        assert_eq!(plan.steps[0].max_attempts, 3);
        assert_eq!(plan.steps[0].backoff_base_ms, 250);
        assert_eq!(plan.steps[0].timeout_ms, 60_000);
    }

    #[test]
    fn build_plan_fails_on_uncovered_action() {
        let agents = vec![agent("scraper", Some("scraping"), &[], &["scrape"])];
        let requirements = req("scraping", &["scrape", "deploy"], &[]);
        let recs = score_agents(&requirements, &agents);
        let err = build_plan(&requirements, &recs, &agents, Map::new()).unwrap_err();
        assert!(err.message.contains("deploy"));
    }
}
