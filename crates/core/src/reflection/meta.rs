use persona_llm::provider::{CompletionRequest, LlmProvider};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::parse::{extract_object, lenient_f32, lenient_text};
use super::stage::{StageOutcome, narrate};
use crate::types::TraitVector;

pub const DEFAULT_FOCUS: &str = "general-reflection";
const SUMMARY_CHARS: usize = 120;

/// Keyword themes for choosing the next focus. Checked in order; the first
/// theme with any keyword present wins.
const THEMES: &[(&str, &[&str])] = &[
    (
        "emotion-regulation",
        &["emotion", "feeling", "anxi", "stress", "anger", "angry", "upset", "感情", "気持ち", "不安", "怒り", "落ち着"],
    ),
    (
        "ethical-judgement",
        &["ethic", "moral", "fair", "honest", "responsib", "right and wrong", "倫理", "道徳", "責任", "正しさ", "誠実"],
    ),
    (
        "continuous-growth",
        &["grow", "learn", "improv", "progress", "develop", "成長", "学び", "学ぶ", "改善", "進歩"],
    ),
    (
        "empathy-and-communication",
        &["empath", "listen", "understand", "communicat", "connect", "共感", "理解", "対話", "寄り添", "伝え"],
    ),
];

const META_SYSTEM: &str = "You review an AI persona's introspection and decide how it should grow. \
Answer with one JSON object and nothing else: \
{\"summary\": string, \"growthAdjustment\": number between 0 and 1, \
\"nextFocus\": string, \"reasoning\": string}.";

/// Where a field of a [`MetaProposal`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalSource {
    /// Every field was read from model JSON.
    Parsed,
    /// Some fields were read, the rest filled by heuristics.
    Partial,
    /// No usable JSON; all fields heuristic.
    Heuristic,
}

/// Fully-typed result of Meta-Reflect. Never partially filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaProposal {
    pub summary: String,
    pub growth_adjustment: f32,
    pub next_focus: String,
    pub reasoning: String,
    pub source: ProposalSource,
}

impl MetaProposal {
    pub fn heuristic(introspection: &str, traits: &TraitVector) -> Self {
        Self {
            summary: truncate_summary(introspection),
            growth_adjustment: heuristic_growth(traits),
            next_focus: match_theme(introspection).to_string(),
            reasoning: "derived from keyword and trait heuristics".to_string(),
            source: ProposalSource::Heuristic,
        }
    }
}

/// Ask the narrator for a growth proposal. A failed call or output without
/// usable JSON yields the heuristic proposal.
pub async fn meta_reflect(
    narrator: &dyn LlmProvider,
    introspection: &str,
    traits: &TraitVector,
    limit: Duration,
) -> StageOutcome<MetaProposal> {
    let prompt = format!(
        "Introspection:\n{introspection}\n\nCurrent traits: calm={:.2}, empathy={:.2}, curiosity={:.2}",
        traits.calm, traits.empathy, traits.curiosity
    );
    let request = CompletionRequest::prompt(META_SYSTEM, prompt).with_limits(400, 0.3);

    let text = match narrate(narrator, request, limit).await {
        Ok(text) => text,
        Err(e) => {
            return StageOutcome::from_result("meta_reflect", Err(e), || {
                MetaProposal::heuristic(introspection, traits)
            });
        }
    };

    match extract_object(&text) {
        Some(obj) => StageOutcome::Generated(interpret(&obj, introspection, traits)),
        None => {
            tracing::warn!(stage = "meta_reflect", "no JSON object in output, using heuristics");
            StageOutcome::Fallback {
                value: MetaProposal::heuristic(introspection, traits),
                reason: "no JSON object in output".to_string(),
            }
        }
    }
}

/// Fill a proposal from model JSON, field by field.
pub fn interpret(obj: &Map<String, Value>, introspection: &str, traits: &TraitVector) -> MetaProposal {
    let field = |camel: &str, snake: &str| obj.get(camel).or_else(|| obj.get(snake));

    let summary = lenient_text(field("summary", "summary"));
    let growth = lenient_f32(field("growthAdjustment", "growth_adjustment"));
    let focus = lenient_text(field("nextFocus", "next_focus"));
    let reasoning = lenient_text(field("reasoning", "reasoning"));

    let found = [summary.is_some(), growth.is_some(), focus.is_some(), reasoning.is_some()];
    let source = if found.iter().all(|f| *f) {
        ProposalSource::Parsed
    } else if found.iter().any(|f| *f) {
        ProposalSource::Partial
    } else {
        ProposalSource::Heuristic
    };

    MetaProposal {
        summary: summary.unwrap_or_else(|| truncate_summary(introspection)),
        growth_adjustment: growth
            .map(|g| g.clamp(0.0, 1.0))
            .unwrap_or_else(|| heuristic_growth(traits)),
        next_focus: focus.unwrap_or_else(|| match_theme(introspection).to_string()),
        reasoning: reasoning.unwrap_or_else(|| "derived from keyword and trait heuristics".to_string()),
        source,
    }
}

/// First 120 characters followed by an ellipsis.
pub fn truncate_summary(text: &str) -> String {
    let head: String = text.trim().chars().take(SUMMARY_CHARS).collect();
    format!("{head}...")
}

/// Distance of the mean trait level from neutral, offset from 0.5.
pub fn heuristic_growth(traits: &TraitVector) -> f32 {
    (0.5 + (traits.mean() - 0.5).abs()).clamp(0.0, 1.0)
}

pub fn match_theme(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    THEMES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(theme, _)| *theme)
        .unwrap_or(DEFAULT_FOCUS)
}
