use persona_llm::provider::{CompletionRequest, LlmProvider};
use std::time::Duration;

use super::stage::{StageOutcome, narrate};
use crate::cognition::self_referent::SelfReferentClassifier;
use crate::types::{APOLOGY_NARRATIVE, DepthHint, SelfReferentInfo};

const REFLECT_SYSTEM: &str = "You are the reflective voice of an AI persona. \
Look back on the exchange below in two or three sentences, first person, \
describing what you noticed about the conversation and your own reply. \
Do not address the user.";

#[derive(Debug, Clone)]
pub struct Reflection {
    pub narrative: StageOutcome<String>,
    /// Derived from the reply, not from the narrative.
    pub depth_hint: DepthHint,
    pub referent: SelfReferentInfo,
}

/// First stage: narrate the latest exchange.
pub async fn reflect(
    narrator: &dyn LlmProvider,
    classifier: &SelfReferentClassifier,
    user: &str,
    reply: &str,
    growth_avg: Option<f32>,
    limit: Duration,
) -> Reflection {
    let mut prompt = format!("User: {user}\nYou: {reply}");
    if let Some(g) = growth_avg {
        prompt.push_str(&format!("\n\nRecent growth level: {g:.2}"));
    }
    let request = CompletionRequest::prompt(REFLECT_SYSTEM, prompt).with_limits(300, 0.7);
    let narrative = StageOutcome::from_result("reflect", narrate(narrator, request, limit).await, || {
        APOLOGY_NARRATIVE.to_string()
    });

    let referent = classifier.analyze(reply);
    Reflection { narrative, depth_hint: referent.target.into(), referent }
}
