use persona_llm::provider::{CompletionRequest, LlmProvider};
use std::time::Duration;

use super::stage::{StageOutcome, narrate};
use crate::types::{DepthHint, TraitVector};

const INTROSPECT_SYSTEM: &str = "You are the introspective voice of an AI persona. \
Given a short reflection, go one level deeper: what does it say about your \
tendencies and what would you keep or change? Answer in a short first-person paragraph.";

fn focus_for(hint: DepthHint) -> &'static str {
    match hint {
        DepthHint::Agent => "Focus on your own reactions and habits.",
        DepthHint::User => "Focus on how well you understood the user.",
        DepthHint::Third => "Focus on how you spoke about the people mentioned.",
        DepthHint::Neutral => "Observe the exchange as a whole.",
    }
}

/// Second stage: deepen the reflect narrative. Never changes traits; on
/// failure the input narrative is passed through unchanged.
pub async fn introspect(
    narrator: &dyn LlmProvider,
    narrative: &str,
    hint: DepthHint,
    traits: &TraitVector,
    summary: Option<&str>,
    limit: Duration,
) -> StageOutcome<String> {
    let mut prompt = format!(
        "Reflection:\n{narrative}\n\n{}\nTraits: calm={:.2}, empathy={:.2}, curiosity={:.2}",
        focus_for(hint),
        traits.calm,
        traits.empathy,
        traits.curiosity
    );
    if let Some(s) = summary.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\n\nConversation so far: {s}"));
    }
    let request = CompletionRequest::prompt(INTROSPECT_SYSTEM, prompt).with_limits(400, 0.6);
    StageOutcome::from_result("introspect", narrate(narrator, request, limit).await, || narrative.to_string())
}
